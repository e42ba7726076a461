use crate::common::Bitmap;
use crate::gres::JobId;

bitflags::bitflags! {
    /// Per-job GRES behavior flags.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct JobGresFlags: u32 {
        /// Chosen GRES must share a socket with an allocated core.
        const ENFORCE_BINDING = 1 << 0;
        /// Successive tasks on a socket may not share a sharing device.
        const ONE_TASK_PER_SHARING = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Cluster-wide selection policy knobs.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct SelectParams: u32 {
        /// Order shared draws by least-loaded sharing device.
        const LL_SHARED_GRES = 1 << 0;
        /// Allow a job's shared draws to span multiple sharing devices.
        const MULTIPLE_SHARING_GRES_PJ = 1 << 1;
    }
}

/// The slice of the cluster node table this core reads.
#[derive(Debug, Clone, Default)]
pub struct NodeRecord {
    pub name: String,
    pub sockets: u16,
    pub cores_per_socket: u16,
    /// Threads (usable CPUs) per core.
    pub tpc: u16,
}

/// The job's committed resource allocation. The core bitmap is packed:
/// each allocated node contributes `sockets * cores_per_socket` bits,
/// concatenated in job-node order.
#[derive(Debug, Clone, Default)]
pub struct JobResources {
    /// Allocated nodes, indexed by global node index.
    pub node_bitmap: Bitmap,
    pub core_bitmap: Bitmap,
    /// All remaining vectors are indexed by job node index (the rank of a
    /// node among the set bits of `node_bitmap`).
    pub tasks_per_node: Vec<u16>,
    pub sockets_per_node: Vec<u16>,
    pub cores_per_socket: Vec<u16>,
    pub cpus_per_node: Vec<u16>,
}

impl JobResources {
    pub fn node_cnt(&self) -> usize {
        self.node_bitmap.len()
    }

    /// Socket and core-per-socket counts recorded for the job's n-th
    /// allocated node.
    pub fn geometry(&self, job_node_inx: usize) -> Option<(usize, usize)> {
        let sockets = *self.sockets_per_node.get(job_node_inx)? as usize;
        let cores = *self.cores_per_socket.get(job_node_inx)? as usize;
        if sockets == 0 || cores == 0 {
            return None;
        }
        Some((sockets, cores))
    }

    /// Index of the first core bit belonging to the job's n-th allocated
    /// node.
    pub fn core_offset(&self, job_node_inx: usize) -> Option<usize> {
        if job_node_inx >= self.sockets_per_node.len() {
            return None;
        }
        let mut offset = 0;
        for i in 0..job_node_inx {
            offset +=
                self.sockets_per_node[i] as usize * *self.cores_per_socket.get(i)? as usize;
        }
        Some(offset)
    }

    /// CPUs actually used by the job on its n-th allocated node.
    pub fn cpus(&self, job_node_inx: usize) -> Option<u16> {
        self.cpus_per_node.get(job_node_inx).copied()
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobRecord {
    pub id: JobId,
    pub resources: JobResources,
    pub overcommit: bool,
    pub flags: JobGresFlags,
}

/// The job's multi-core task layout options; zero means unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct McOptions {
    pub ntasks_per_job: u32,
    pub ntasks_per_node: u16,
    pub ntasks_per_socket: u16,
    pub ntasks_per_core: u16,
    pub cpus_per_task: u16,
    pub sockets_per_node: u16,
}
