use crate::common::Bitmap;
use crate::gres::{GresJobId, GresNodeId};

/// Socket selector used by the pickers: a specific socket, or the pool of
/// units that have no socket affinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockTarget {
    Socket(usize),
    Any,
}

/// Socket-level view of one GRES kind on one candidate node, built by the
/// upstream socket scan and consumed (and partially rewritten) by the
/// feasibility filter and the pickers.
///
/// `job` and `node` are handles into the caller-owned tables; ownership of
/// the job and node state never moves into this record.
#[derive(Debug, Clone, Default)]
pub struct SockGres {
    pub job: GresJobId,
    pub node: GresNodeId,
    /// Usable units on this node after upstream pruning.
    pub total_cnt: u64,
    /// Cap implied by CPU/memory constraints; 0 = unset.
    pub max_node_gres: u64,
    pub sock_cnt: usize,
    /// Units affine to each socket; present only for kinds with socket
    /// topology.
    pub cnt_by_sock: Option<Vec<u64>>,
    /// Unit indices affine to each socket (topology-slot indices for
    /// shared kinds).
    pub bits_by_sock: Vec<Option<Bitmap>>,
    /// Unit indices with no socket affinity.
    pub bits_any_sock: Option<Bitmap>,
}

impl SockGres {
    pub(crate) fn sock_bits(&self, target: SockTarget) -> Option<&Bitmap> {
        match target {
            SockTarget::Any => self.bits_any_sock.as_ref(),
            SockTarget::Socket(s) => self.bits_by_sock.get(s).and_then(|b| b.as_ref()),
        }
    }
}
