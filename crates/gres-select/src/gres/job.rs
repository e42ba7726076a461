use crate::common::Bitmap;
use crate::gres::{GresFlags, GresTypeId};

/// One GRES kind requested by a job: the request counters plus the
/// selection outputs filled in by the placement core.
///
/// The counters follow the convention of the surrounding scheduler: zero
/// means "not requested" for the `per_*` family and the `*_per_gres`
/// qualifiers, while unset multipliers that have a meaningful zero are
/// `Option`s.
#[derive(Debug, Clone, Default)]
pub struct GresJobState {
    /// Kind name for logging (e.g. "gpu", "shard").
    pub name: String,
    pub flags: GresFlags,
    pub type_id: GresTypeId,

    pub per_node: u64,
    pub per_socket: u64,
    pub per_task: u64,
    pub per_job: u64,

    pub cpus_per_gres: u16,
    pub def_cpus_per_gres: u16,
    pub mem_per_gres: u64,
    pub def_mem_per_gres: u64,
    pub ntasks_per_gres: Option<u16>,

    /// Cluster node count; zero until the first selection pass runs.
    pub total_node_cnt: u32,
    /// Units selected across all nodes.
    pub total_gres: u64,
    /// Units selected on each node, indexed by global node index.
    pub cnt_node_select: Vec<u64>,
    /// Chosen unit indices on each node; `None` for untouched nodes and
    /// for kinds without topology.
    pub bit_select: Vec<Option<Bitmap>>,
    /// For shared kinds: fractional count drawn from each topology slot,
    /// per node.
    pub per_bit_select: Vec<Option<Vec<u64>>>,
}

impl GresJobState {
    pub fn is_shared(&self) -> bool {
        self.flags.contains(GresFlags::SHARED)
    }

    pub fn is_sharing(&self) -> bool {
        self.flags.contains(GresFlags::SHARING)
    }

    /// CPUs required per selected unit: the explicit request, then the
    /// tasks-per-gres derivation, then the configured default.
    pub(crate) fn effective_cpus_per_gres(&self, cpus_per_task: u16) -> u16 {
        if self.cpus_per_gres != 0 {
            self.cpus_per_gres
        } else if let Some(ntasks) = self.ntasks_per_gres.filter(|&n| n > 0) {
            ntasks.saturating_mul(cpus_per_task)
        } else {
            self.def_cpus_per_gres
        }
    }

    pub(crate) fn effective_mem_per_gres(&self) -> u64 {
        if self.mem_per_gres != 0 {
            self.mem_per_gres
        } else {
            self.def_mem_per_gres
        }
    }

    pub(crate) fn ensure_cnt_node_select(&mut self, node_cnt: usize) {
        if self.cnt_node_select.is_empty() {
            self.cnt_node_select = vec![0; node_cnt];
        }
    }

    pub(crate) fn ensure_bit_select(&mut self, node_cnt: usize) {
        if self.bit_select.is_empty() {
            self.bit_select = vec![None; node_cnt];
        }
    }

    /// Prepare the per-slot draw counters for a shared selection on one
    /// node, sized to that node's freshly allocated selection bitmap.
    pub(crate) fn init_per_bit_select(&mut self, node_inx: usize) {
        if self.per_bit_select.is_empty() {
            self.per_bit_select = vec![None; self.total_node_cnt as usize];
        }
        let slots = self.bit_select[node_inx]
            .as_ref()
            .map(|b| b.len())
            .unwrap_or(0);
        self.per_bit_select[node_inx] = Some(vec![0; slots]);
    }
}
