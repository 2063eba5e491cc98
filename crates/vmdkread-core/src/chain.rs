//! Snapshot chain resolution.
//!
//! A delta-link VMDK stores only the grains written since the snapshot was
//! taken; everything else defers to the parent image. A [`SnapshotChain`]
//! is the child-to-root list of [`Layer`]s that resolves such reads: hole
//! runs in a layer fall through to its ancestors, and only a hole at the
//! root reads as zeroes.

use crate::error::Result;
use crate::extent::ExtentSet;
use crate::source::SourcePool;

/// One image layer: an extent set plus the sources backing it.
pub struct Layer {
    extent_set: ExtentSet,
    pool: SourcePool,
    content_identifier: u32,
    parent_content_identifier: u32,
}

impl Layer {
    /// Creates a layer from a resolved extent set and its source pool.
    pub fn new(
        extent_set: ExtentSet,
        pool: SourcePool,
        content_identifier: u32,
        parent_content_identifier: u32,
    ) -> Self {
        Self {
            extent_set,
            pool,
            content_identifier,
            parent_content_identifier,
        }
    }

    /// Logical size of this layer in bytes.
    pub fn size(&self) -> u64 {
        self.extent_set.size()
    }

    /// The layer's extent set.
    pub fn extent_set(&self) -> &ExtentSet {
        &self.extent_set
    }

    /// Content identifier of this layer.
    pub fn content_identifier(&self) -> u32 {
        self.content_identifier
    }

    /// Content identifier this layer declares for its parent.
    pub fn parent_content_identifier(&self) -> u32 {
        self.parent_content_identifier
    }

    /// Consumes the layer, returning its source pool.
    pub fn into_pool(self) -> SourcePool {
        self.pool
    }
}

/// Child-to-root list of image layers.
///
/// Index 0 is the opened (child) layer; the last layer is the root. The
/// media size presented to readers is fixed by the child: ancestors may be
/// physically smaller or larger, and reads past an ancestor's own bound
/// fall back to zeroes rather than failing.
pub struct SnapshotChain {
    layers: Vec<Layer>,
}

impl SnapshotChain {
    /// Creates a chain of depth 1.
    pub fn new(child: Layer) -> Self {
        Self {
            layers: vec![child],
        }
    }

    /// Appends ancestor layers, child-to-root order, below the current
    /// deepest layer.
    pub fn attach_ancestors(&mut self, mut ancestors: Vec<Layer>) {
        self.layers.append(&mut ancestors);
    }

    /// Consumes the chain, returning its layers child-first.
    pub fn into_layers(self) -> Vec<Layer> {
        self.layers
    }

    /// Number of layers in the chain.
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// The opened (child) layer.
    pub fn child(&self) -> &Layer {
        &self.layers[0]
    }

    /// Logical media size in bytes, fixed by the child layer.
    pub fn media_size(&self) -> u64 {
        self.layers[0].size()
    }

    /// Reads up to `buf.len()` bytes at `offset` in the child's address
    /// space, resolving holes through the ancestor chain.
    ///
    /// Reads at or past the end of the media return 0 bytes; reads
    /// crossing it return the bytes before it. The filled buffer is
    /// stitched in offset order with no gaps or overlaps even when
    /// sub-ranges resolve in different layers.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let media_size = self.media_size();
        if offset >= media_size || buf.is_empty() {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(media_size - offset) as usize;
        read_layers(&mut self.layers, offset, &mut buf[..len])?;
        Ok(len)
    }
}

/// Fills `buf` from `layers[0]` at `offset`, deferring hole runs to the
/// remaining layers and zero-filling once no layers remain.
fn read_layers(layers: &mut [Layer], offset: u64, buf: &mut [u8]) -> Result<()> {
    let Some((layer, ancestors)) = layers.split_first_mut() else {
        buf.fill(0);
        return Ok(());
    };

    let layer_size = layer.extent_set.size();
    let mut filled = 0usize;
    while filled < buf.len() {
        let pos = offset + filled as u64;

        // An ancestor may end before the child's media size; past its own
        // bound it contributes zeroes.
        if pos >= layer_size {
            buf[filled..].fill(0);
            break;
        }

        let remaining = (buf.len() - filled) as u64;
        let Some(run) = layer.extent_set.run_at(pos, remaining) else {
            buf[filled..].fill(0);
            break;
        };
        let dst = &mut buf[filled..filled + run.len as usize];
        if run.is_hole {
            read_layers(ancestors, pos, dst)?;
        } else {
            layer.extent_set.read_at(&mut layer.pool, pos, dst)?;
        }
        filled += run.len as usize;
    }
    Ok(())
}
