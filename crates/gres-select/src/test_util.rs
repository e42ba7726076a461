use crate::common::Bitmap;
use crate::gres::{
    GresFlags, GresJobState, GresNodeState, JobGresFlags, JobRecord, JobResources, NodeRecord,
    SockGres,
};

/// Chained builder for a per-(job, kind) GRES request.
#[derive(Default, Clone)]
pub(crate) struct JobStateBuilder {
    state: GresJobState,
}

pub(crate) fn job_state(name: &str) -> JobStateBuilder {
    JobStateBuilder {
        state: GresJobState {
            name: name.to_string(),
            ..Default::default()
        },
    }
}

impl JobStateBuilder {
    pub fn sharing(mut self) -> Self {
        self.state.flags |= GresFlags::SHARING;
        self
    }

    pub fn shared(mut self) -> Self {
        self.state.flags |= GresFlags::SHARED;
        self
    }

    pub fn type_id(mut self, type_id: u32) -> Self {
        self.state.type_id = type_id;
        self
    }

    pub fn per_node(mut self, cnt: u64) -> Self {
        self.state.per_node = cnt;
        self
    }

    pub fn per_socket(mut self, cnt: u64) -> Self {
        self.state.per_socket = cnt;
        self
    }

    pub fn per_task(mut self, cnt: u64) -> Self {
        self.state.per_task = cnt;
        self
    }

    pub fn per_job(mut self, cnt: u64) -> Self {
        self.state.per_job = cnt;
        self
    }

    pub fn cpus_per_gres(mut self, cpus: u16) -> Self {
        self.state.cpus_per_gres = cpus;
        self
    }

    pub fn mem_per_gres(mut self, mem: u64) -> Self {
        self.state.mem_per_gres = mem;
        self
    }

    pub fn finish(self) -> GresJobState {
        self.state
    }
}

/// Chained builder for a per-(node, kind) GRES state.
#[derive(Default, Clone)]
pub(crate) struct NodeStateBuilder {
    state: GresNodeState,
}

pub(crate) fn node_state() -> NodeStateBuilder {
    NodeStateBuilder::default()
}

impl NodeStateBuilder {
    /// A device kind with `n` indexed units, one topology slot per unit.
    pub fn units(mut self, n: usize) -> Self {
        self.state.cnt_avail = n as u64;
        self.state.bit_alloc = Some(Bitmap::new(n));
        self.state.topo_cnt = n;
        self.state.topo_gres_cnt_avail = vec![1; n];
        self.state.topo_gres_cnt_alloc = vec![0; n];
        self.state.topo_type_id = vec![0; n];
        self.state.topo_gres_bitmap = (0..n)
            .map(|i| Some(Bitmap::from_indices(n, &[i])))
            .collect();
        self
    }

    /// A plain countable kind with no topology.
    pub fn count_only(mut self, avail: u64, alloc: u64) -> Self {
        self.state.cnt_avail = avail;
        self.state.cnt_alloc = alloc;
        self
    }

    pub fn shared(mut self) -> Self {
        self.state.flags |= GresFlags::SHARED;
        self
    }

    /// Append a sharing-device topology slot holding `avail` fractional
    /// units, `alloc` of them taken. Slot bitmaps are re-sized at finish.
    pub fn shared_slot(mut self, avail: u64, alloc: u64) -> Self {
        self.state.topo_cnt += 1;
        self.state.topo_gres_cnt_avail.push(avail);
        self.state.topo_gres_cnt_alloc.push(alloc);
        self.state.topo_type_id.push(0);
        self.state.cnt_avail += avail;
        self.state.cnt_alloc += alloc;
        self
    }

    pub fn slot_type(mut self, t: usize, type_id: u32) -> Self {
        self.state.topo_type_id[t] = type_id;
        self
    }

    /// Mark units as already allocated to other jobs.
    pub fn allocated(mut self, units: &[usize]) -> Self {
        let topo_cnt = self.state.topo_cnt;
        let bit_alloc = self.state.bit_alloc.get_or_insert_with(|| Bitmap::new(topo_cnt));
        for &u in units {
            bit_alloc.set(u);
        }
        self.state.cnt_alloc += units.len() as u64;
        self
    }

    pub fn links(mut self, links: Vec<Vec<i32>>) -> Self {
        self.state.links = links;
        self
    }

    pub fn finish(mut self) -> GresNodeState {
        if self.state.flags.contains(GresFlags::SHARED)
            && self.state.topo_cnt > 0
            && self.state.topo_gres_bitmap.is_empty()
        {
            let n = self.state.topo_cnt;
            self.state.topo_gres_bitmap = (0..n)
                .map(|i| Some(Bitmap::from_indices(n, &[i])))
                .collect();
        }
        self.state
    }
}

/// Chained builder for a socket-view record. `job` and `node` are raw
/// handle values into the test's tables.
#[derive(Default, Clone)]
pub(crate) struct SockRecordBuilder {
    record: SockGres,
}

pub(crate) fn sock_record(job: u32, node: u32) -> SockRecordBuilder {
    SockRecordBuilder {
        record: SockGres {
            job: job.into(),
            node: node.into(),
            ..Default::default()
        },
    }
}

impl SockRecordBuilder {
    pub fn total_cnt(mut self, cnt: u64) -> Self {
        self.record.total_cnt = cnt;
        self
    }

    pub fn sock_cnt(mut self, cnt: usize) -> Self {
        self.record.sock_cnt = cnt;
        self
    }

    pub fn cnt_by_sock(mut self, counts: Vec<u64>) -> Self {
        self.record.sock_cnt = counts.len();
        self.record.cnt_by_sock = Some(counts);
        self
    }

    /// Unit indices affine to each socket, over `len` units.
    pub fn bits_by_sock(mut self, len: usize, socks: Vec<Option<Vec<usize>>>) -> Self {
        self.record.sock_cnt = socks.len();
        self.record.bits_by_sock = socks
            .into_iter()
            .map(|indices| indices.map(|i| Bitmap::from_indices(len, &i)))
            .collect();
        self
    }

    pub fn bits_any_sock(mut self, len: usize, indices: &[usize]) -> Self {
        self.record.bits_any_sock = Some(Bitmap::from_indices(len, indices));
        self
    }

    pub fn finish(self) -> SockGres {
        self.record
    }
}

/// One allocated node of a test cluster.
struct ClusterNode {
    allocated: bool,
    sockets: u16,
    cores_per_socket: u16,
    alloc_cores: Vec<usize>,
    tasks: u16,
}

/// Chained builder for a job allocation plus the matching node table.
#[derive(Default)]
pub(crate) struct ClusterBuilder {
    nodes: Vec<ClusterNode>,
    tpc: u16,
    overcommit: bool,
    flags: JobGresFlags,
}

pub(crate) fn cluster() -> ClusterBuilder {
    ClusterBuilder {
        tpc: 1,
        ..Default::default()
    }
}

impl ClusterBuilder {
    /// An allocated node: `alloc_cores` are node-local core indices.
    pub fn node(mut self, sockets: u16, cores_per_socket: u16, alloc_cores: &[usize]) -> Self {
        self.nodes.push(ClusterNode {
            allocated: true,
            sockets,
            cores_per_socket,
            alloc_cores: alloc_cores.to_vec(),
            tasks: 0,
        });
        self
    }

    /// Task count committed for the most recently added node.
    pub fn tasks(mut self, tasks: u16) -> Self {
        self.nodes.last_mut().unwrap().tasks = tasks;
        self
    }

    pub fn unallocated_node(mut self, sockets: u16, cores_per_socket: u16) -> Self {
        self.nodes.push(ClusterNode {
            allocated: false,
            sockets,
            cores_per_socket,
            alloc_cores: Vec::new(),
            tasks: 0,
        });
        self
    }

    pub fn enforce_binding(mut self) -> Self {
        self.flags |= JobGresFlags::ENFORCE_BINDING;
        self
    }

    pub fn one_task_per_sharing(mut self) -> Self {
        self.flags |= JobGresFlags::ONE_TASK_PER_SHARING;
        self
    }

    pub fn finish(self) -> (JobRecord, Vec<NodeRecord>) {
        let mut node_bitmap = Bitmap::new(self.nodes.len());
        let mut core_bits = Vec::new();
        let mut tasks_per_node = Vec::new();
        let mut sockets_per_node = Vec::new();
        let mut cores_per_socket = Vec::new();
        let mut cpus_per_node = Vec::new();
        let mut node_table = Vec::new();
        let mut core_offset = 0;

        for (i, node) in self.nodes.iter().enumerate() {
            node_table.push(NodeRecord {
                name: format!("node{i}"),
                sockets: node.sockets,
                cores_per_socket: node.cores_per_socket,
                tpc: self.tpc,
            });
            if !node.allocated {
                continue;
            }
            node_bitmap.set(i);
            for &c in &node.alloc_cores {
                core_bits.push(core_offset + c);
            }
            core_offset += node.sockets as usize * node.cores_per_socket as usize;
            tasks_per_node.push(node.tasks);
            sockets_per_node.push(node.sockets);
            cores_per_socket.push(node.cores_per_socket);
            cpus_per_node.push(node.alloc_cores.len() as u16 * self.tpc);
        }

        let job = JobRecord {
            id: 1.into(),
            resources: JobResources {
                node_bitmap,
                core_bitmap: Bitmap::from_indices(core_offset, &core_bits),
                tasks_per_node,
                sockets_per_node,
                cores_per_socket,
                cpus_per_node,
            },
            overcommit: self.overcommit,
            flags: self.flags,
        };
        (job, node_table)
    }
}

/// Multi-core options with only the task-per-job count set.
pub(crate) fn mc_tasks(ntasks_per_job: u32) -> crate::gres::McOptions {
    crate::gres::McOptions {
        ntasks_per_job,
        cpus_per_task: 1,
        ..Default::default()
    }
}
