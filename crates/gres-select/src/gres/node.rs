use crate::common::Bitmap;
use crate::gres::{GresFlags, GresTypeId};

/// GRES state of one kind on one node. Owned by the node table; the
/// selection core only reads it and tracks its own draws separately.
#[derive(Debug, Clone, Default)]
pub struct GresNodeState {
    pub flags: GresFlags,
    /// Total units of this kind on the node.
    pub cnt_avail: u64,
    /// Units already allocated to running jobs.
    pub cnt_alloc: u64,
    /// Unit indices already allocated; absent when the node reports no
    /// topology for this kind.
    pub bit_alloc: Option<Bitmap>,
    /// Number of topology slots (sub-devices / affinity groups).
    pub topo_cnt: usize,
    pub topo_gres_cnt_avail: Vec<u64>,
    pub topo_gres_cnt_alloc: Vec<u64>,
    /// Unit indices belonging to each slot.
    pub topo_gres_bitmap: Vec<Option<Bitmap>>,
    pub topo_type_id: Vec<GresTypeId>,
    /// Pairwise link counts between units; usable only when its dimension
    /// matches the node's unit count.
    pub links: Vec<Vec<i32>>,
}

impl GresNodeState {
    pub fn has_topo(&self) -> bool {
        self.topo_cnt > 0
    }

    pub fn links_usable(&self, gres_cnt: usize) -> bool {
        self.links.len() == gres_cnt
    }

    pub fn link(&self, g: usize, h: usize) -> i64 {
        self.links
            .get(g)
            .and_then(|row| row.get(h))
            .copied()
            .unwrap_or(0) as i64
    }

    pub fn topo_type(&self, t: usize) -> GresTypeId {
        self.topo_type_id.get(t).copied().unwrap_or(0)
    }

    pub fn bit_alloc_test(&self, g: usize) -> bool {
        self.bit_alloc.as_ref().is_some_and(|b| b.test(g))
    }

    /// Shared draws must pack onto the sharing device that is already busy.
    pub fn use_busy_dev(&self) -> bool {
        self.flags.contains(GresFlags::SHARED) && self.cnt_alloc != 0
    }
}
