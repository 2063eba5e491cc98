//! vmdkread CLI - inspect VMDK images and export them to raw disk images.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use vmdkread_core::{AccessMode, VmdkHandle, PARENT_CID_NONE};

/// Read-only tool for inspecting and exporting VMDK virtual disk images.
#[derive(Parser)]
#[command(name = "vmdkread")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display information about a VMDK image.
    Info {
        /// Path to the VMDK image (descriptor or sparse extent file).
        image: PathBuf,
    },

    /// Export the logical disk contents to a raw image file.
    Export {
        /// Path to the VMDK image.
        image: PathBuf,

        /// Output raw image path.
        output: PathBuf,

        /// Parent image for delta links. Repeat for deeper chains,
        /// nearest ancestor first.
        #[arg(short, long)]
        parent: Vec<PathBuf>,

        /// Read buffer size in megabytes.
        #[arg(long, default_value = "4")]
        buffer_size: usize,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Info { image } => show_info(&image)?,
        Commands::Export {
            image,
            output,
            parent,
            buffer_size,
            quiet,
        } => run_export(&image, &output, &parent, buffer_size, quiet)?,
    }

    Ok(())
}

/// Opens an image and its extent data files.
fn open_image(path: &Path) -> Result<VmdkHandle> {
    let mut handle = VmdkHandle::new();
    handle
        .open(path, AccessMode::Read)
        .with_context(|| format!("failed to open '{}'", path.display()))?;
    if handle.needs_extent_data_files()? {
        handle
            .open_extent_data_files()
            .with_context(|| format!("failed to open extent data files of '{}'", path.display()))?;
    }
    Ok(handle)
}

/// Opens an image together with an explicit parent chain, nearest ancestor
/// first.
fn open_image_with_parents(path: &Path, parents: &[PathBuf]) -> Result<VmdkHandle> {
    let mut handle = open_image(path)?;

    // Build the ancestor chain root-first so each link is complete before
    // it is attached.
    let mut ancestor: Option<VmdkHandle> = None;
    for parent_path in parents.iter().rev() {
        let mut parent = open_image(parent_path)?;
        if let Some(grandparent) = ancestor.take() {
            parent.set_parent(grandparent)?;
        }
        ancestor = Some(parent);
    }
    if let Some(parent) = ancestor {
        handle.set_parent(parent)?;
    }
    Ok(handle)
}

fn show_info(image: &Path) -> Result<()> {
    let mut handle = open_image(image)?;

    println!("VMDK image information");
    println!("======================");
    println!();
    println!("Disk type:           {}", handle.disk_type()?);
    println!(
        "Media size:          {} ({} bytes)",
        format_bytes(handle.media_size()?),
        handle.media_size()?
    );
    println!("Content identifier:  0x{:08x}", handle.content_identifier()?);

    let parent_cid = handle.parent_content_identifier()?;
    if parent_cid != PARENT_CID_NONE {
        println!("Parent identifier:   0x{parent_cid:08x}");
        if let Some(parent) = handle.parent_filename()? {
            println!("Parent filename:     {parent}");
        }
    }

    println!();
    let descriptors = handle.extent_descriptors()?;
    println!("Extents:             {}", descriptors.len());
    for (i, extent) in descriptors.iter().enumerate() {
        println!(
            "  {}. {} - {} ({})",
            i + 1,
            extent.filename.as_deref().unwrap_or("<none>"),
            format_bytes(extent.size_bytes),
            extent.extent_type
        );
    }

    handle.close()?;
    Ok(())
}

fn run_export(
    image: &Path,
    output: &Path,
    parents: &[PathBuf],
    buffer_size_mb: usize,
    quiet: bool,
) -> Result<()> {
    let mut handle = open_image_with_parents(image, parents)?;
    let media_size = handle.media_size()?;

    if !quiet {
        println!("Exporting {}", image.display());
        println!("Disk type:  {}", handle.disk_type()?);
        println!("Media size: {}", format_bytes(media_size));
        println!("Output:     {}", output.display());
        println!();
    }

    let file = File::create(output)
        .with_context(|| format!("failed to create '{}'", output.display()))?;
    let mut writer = BufWriter::new(file);

    let progress = if quiet {
        None
    } else {
        let bar = ProgressBar::new(media_size);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
            .progress_chars("#>-");
        bar.set_style(style);
        Some(bar)
    };

    let mut buf = vec![0u8; buffer_size_mb.max(1) * 1024 * 1024];
    let mut exported = 0u64;
    loop {
        let n = handle.read_buffer(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        exported += n as u64;
        if let Some(bar) = &progress {
            bar.set_position(exported);
        }
    }
    writer.flush()?;

    if let Some(bar) = progress {
        bar.finish_with_message("done");
    }
    handle.close()?;

    if !quiet {
        println!();
        println!(
            "Exported {} to {}",
            format_bytes(exported),
            output.display()
        );
    }

    Ok(())
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
