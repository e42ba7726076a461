pub mod cluster;
pub mod handle;
pub mod job;
pub mod node;
pub mod sock;

pub use cluster::{JobGresFlags, JobRecord, JobResources, McOptions, NodeRecord, SelectParams};
pub use handle::{GresJobId, GresNodeId, GresTable, JobId};
pub use job::GresJobState;
pub use node::GresNodeState;
pub use sock::{SockGres, SockTarget};

/// GRES type identifier; 0 means untyped.
pub type GresTypeId = u32;

pub type GresJobTable = GresTable<GresJobId, GresJobState>;
pub type GresNodeTable = GresTable<GresNodeId, GresNodeState>;

bitflags::bitflags! {
    /// Properties of a GRES kind.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct GresFlags: u32 {
        /// A physical device whose capacity can be subdivided (e.g. a GPU).
        const SHARING = 1 << 0;
        /// A request that draws fractional units from a sharing device's
        /// topology slots.
        const SHARED = 1 << 1;
    }
}
