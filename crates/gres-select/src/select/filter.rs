use smallvec::{smallvec, SmallVec};

use crate::common::error::SelectError;
use crate::common::Bitmap;
use crate::gres::{GresJobTable, SockGres};

/// Per-node knobs for the feasibility filter. `None` disables the
/// corresponding check or multiplier (memory not tracked, socket/task
/// counts not requested).
#[derive(Debug, Clone)]
pub struct NodeFilterParams<'a> {
    pub avail_mem: Option<u64>,
    /// Usable CPUs on this node after specialized-core and partition caps.
    pub max_cpus: u16,
    pub enforce_binding: bool,
    pub core_bitmap: Option<&'a Bitmap>,
    pub sockets: u16,
    pub cores_per_sock: u16,
    pub cpus_per_core: u16,
    pub sock_per_node: Option<u32>,
    pub task_per_node: Option<u16>,
    pub cpus_per_task: u16,
    pub whole_node: bool,
}

/// GPU counts reported back to the node scorer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilteredCounts {
    /// Total usable GPUs on the node.
    pub avail_gpus: u16,
    /// GPUs on sockets with allocated cores, saturated at 255.
    pub near_gpus: u16,
}

/// Which sockets still have at least one available core.
pub(crate) fn avail_cores_by_sock(
    core_bitmap: &Bitmap,
    sockets: u16,
    cores_per_sock: u16,
) -> SmallVec<[bool; 8]> {
    let mut avail: SmallVec<[bool; 8]> = smallvec![false; sockets as usize];
    'sockets: for s in 0..sockets as usize {
        for c in 0..cores_per_sock as usize {
            let i = s * cores_per_sock as usize + c;
            if i >= core_bitmap.len() {
                break 'sockets;
            }
            if core_bitmap.test(i) {
                avail[s] = true;
                break;
            }
        }
    }
    avail
}

/// Set `max_node_gres` if it is unset or greater than `val`.
fn set_max_node_gres(sock_gres: &mut SockGres, val: u64) -> bool {
    if val != 0 && (sock_gres.max_node_gres == 0 || sock_gres.max_node_gres > val) {
        sock_gres.max_node_gres = val;
        return true;
    }
    false
}

/// Determine which GRES can be used on this node given the available
/// cores, and filter out unusable GRES.
///
/// On success every record has `max_node_gres` set where a CPU or memory
/// cap applies, `total_cnt` reduced to what the caps allow, and (under
/// enforce-binding) socket buckets without available cores zeroed. Any
/// error means the node cannot host the job; the caller drops the
/// candidate without inspecting the partially updated records further.
pub fn remove_unusable(
    sock_gres_list: &mut [SockGres],
    jobs: &GresJobTable,
    params: &NodeFilterParams<'_>,
) -> crate::Result<FilteredCounts> {
    let mut counts = FilteredCounts::default();
    let Some(core_bitmap) = params.core_bitmap else {
        return Ok(counts);
    };
    if sock_gres_list.is_empty() {
        return Ok(counts);
    }

    let mut avail_cores: Option<SmallVec<[bool; 8]>> = None;
    for sock_gres in sock_gres_list.iter_mut() {
        let gres_js = &jobs[sock_gres.job];

        let mut min_gres: u64 = 1;
        if params.whole_node {
            min_gres = sock_gres.total_cnt;
        } else if gres_js.per_node != 0 {
            min_gres = gres_js.per_node;
        }
        if gres_js.per_socket != 0 {
            let mut tmp = gres_js.per_socket;
            if let Some(sock_per_node) = params.sock_per_node {
                tmp *= sock_per_node as u64;
            }
            min_gres = min_gres.max(tmp);
        }
        if gres_js.per_task != 0 {
            let mut tmp = gres_js.per_task;
            if let Some(task_per_node) = params.task_per_node {
                tmp *= task_per_node as u64;
            }
            min_gres = min_gres.max(tmp);
        }

        let cpus_per_gres = gres_js.effective_cpus_per_gres(params.cpus_per_task);
        if cpus_per_gres != 0 {
            let max_gres = (params.max_cpus / cpus_per_gres) as u64;
            if max_gres == 0
                || gres_js.per_node > max_gres
                || gres_js.per_task > max_gres
                || gres_js.per_socket > max_gres
            {
                log::debug!(
                    "insufficient CPUs for any gres/{}: max_gres ({}) = max_cpus ({}) / cpus_per_gres ({})",
                    gres_js.name,
                    max_gres,
                    params.max_cpus,
                    cpus_per_gres
                );
                return Err(SelectError::InsufficientCpus);
            }
        }

        let mem_per_gres = gres_js.effective_mem_per_gres();
        if mem_per_gres != 0 {
            if let Some(avail_mem) = params.avail_mem {
                if mem_per_gres <= avail_mem {
                    sock_gres.max_node_gres = avail_mem / mem_per_gres;
                } else {
                    log::debug!(
                        "insufficient memory for any gres/{}: mem_per_gres ({}) > avail_mem ({})",
                        gres_js.name,
                        mem_per_gres,
                        avail_mem
                    );
                    return Err(SelectError::InsufficientMemory);
                }
            }
        }

        if sock_gres.cnt_by_sock.is_some() && avail_cores.is_none() {
            avail_cores = Some(avail_cores_by_sock(
                core_bitmap,
                params.sockets,
                params.cores_per_sock,
            ));
        }

        // Per-socket count enforcement already happened when the socket
        // buckets were built upstream.
        let mut near_gres_cnt;
        if let Some(cnt_by_sock) = sock_gres.cnt_by_sock.as_mut() {
            let avail_cores = avail_cores.as_ref().unwrap();
            let sockets = (params.sockets as usize).min(cnt_by_sock.len());
            if params.enforce_binding {
                for s in 0..sockets {
                    if !avail_cores[s] {
                        sock_gres.total_cnt = sock_gres.total_cnt.saturating_sub(cnt_by_sock[s]);
                        cnt_by_sock[s] = 0;
                    }
                }
                near_gres_cnt = sock_gres.total_cnt;
            } else {
                near_gres_cnt = sock_gres.total_cnt;
                for s in 0..sockets {
                    if !avail_cores[s] {
                        near_gres_cnt = near_gres_cnt.saturating_sub(cnt_by_sock[s]);
                    }
                }
            }
        } else {
            near_gres_cnt = sock_gres.total_cnt;
        }

        if !params.whole_node {
            // If per-node isn't set, fall back to the per-job counter.
            if !set_max_node_gres(sock_gres, gres_js.per_node) {
                set_max_node_gres(sock_gres, gres_js.per_job);
            }
        }

        // Avoid capping by core count when tasks-per-gres drives a
        // whole-node request.
        if cpus_per_gres != 0 && (gres_js.ntasks_per_gres.is_none() || !params.whole_node) {
            let cpu_cnt = core_bitmap.count() as u64 * params.cpus_per_core as u64;
            let max_gres = cpu_cnt / cpus_per_gres as u64;
            if max_gres == 0 {
                log::debug!(
                    "max_gres == 0 == cpu_cnt ({}) / cpus_per_gres ({})",
                    cpu_cnt,
                    cpus_per_gres
                );
                return Err(SelectError::InsufficientCpus);
            } else if sock_gres.max_node_gres == 0 || sock_gres.max_node_gres > max_gres {
                sock_gres.max_node_gres = max_gres;
            }
        }

        if mem_per_gres != 0 {
            if let Some(avail_mem) = params.avail_mem {
                let max_gres = avail_mem / mem_per_gres;
                sock_gres.total_cnt = sock_gres.total_cnt.min(max_gres);
            }
        }

        if sock_gres.total_cnt < min_gres
            || (sock_gres.max_node_gres != 0 && sock_gres.max_node_gres < min_gres)
        {
            log::debug!(
                "min_gres ({}) is > max_node_gres ({}) or total_cnt ({})",
                min_gres,
                sock_gres.max_node_gres,
                sock_gres.total_cnt
            );
            return Err(SelectError::InsufficientCount);
        }

        if gres_js.is_sharing() {
            counts.avail_gpus = counts
                .avail_gpus
                .saturating_add(sock_gres.total_cnt.min(u16::MAX as u64) as u16);
            if sock_gres.max_node_gres != 0 && sock_gres.max_node_gres < near_gres_cnt {
                near_gres_cnt = sock_gres.max_node_gres;
            }
            let near_sum = counts.near_gpus as u64 + near_gres_cnt;
            counts.near_gpus = if near_sum < 0xff { near_sum as u16 } else { 0xff };
        }
    }

    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{job_state, sock_record};

    fn cores(len: usize, set: &[usize]) -> Bitmap {
        Bitmap::from_indices(len, set)
    }

    fn base_params(core_bitmap: &Bitmap) -> NodeFilterParams<'_> {
        NodeFilterParams {
            avail_mem: None,
            max_cpus: 16,
            enforce_binding: false,
            core_bitmap: Some(core_bitmap),
            sockets: 2,
            cores_per_sock: 4,
            cpus_per_core: 1,
            sock_per_node: None,
            task_per_node: None,
            cpus_per_task: 1,
            whole_node: false,
        }
    }

    #[test]
    fn test_filter_no_core_bitmap_is_feasible() {
        let jobs = vec![job_state("gpu").per_node(2).finish()].into();
        let mut list = vec![sock_record(0, 0).total_cnt(4).finish()];
        let empty = Bitmap::new(0);
        let params = NodeFilterParams {
            core_bitmap: None,
            ..base_params(&empty)
        };
        let counts = remove_unusable(&mut list, &jobs, &params).unwrap();
        assert_eq!(counts, FilteredCounts::default());
    }

    #[test]
    fn test_filter_insufficient_cpus() {
        let jobs = vec![job_state("gpu").per_node(1).cpus_per_gres(32).finish()].into();
        let mut list = vec![sock_record(0, 0).total_cnt(4).finish()];
        let core_bitmap = cores(8, &[0, 4]);
        let err = remove_unusable(&mut list, &jobs, &base_params(&core_bitmap)).unwrap_err();
        assert!(matches!(err, SelectError::InsufficientCpus));
    }

    #[test]
    fn test_filter_insufficient_memory() {
        let jobs = vec![job_state("gpu").per_node(1).mem_per_gres(4096).finish()].into();
        let mut list = vec![sock_record(0, 0).total_cnt(4).finish()];
        let core_bitmap = cores(8, &[0]);
        let params = NodeFilterParams {
            avail_mem: Some(1024),
            ..base_params(&core_bitmap)
        };
        let err = remove_unusable(&mut list, &jobs, &params).unwrap_err();
        assert!(matches!(err, SelectError::InsufficientMemory));
    }

    #[test]
    fn test_filter_memory_sentinel_disables_checks() {
        let jobs = vec![job_state("gpu").per_node(1).mem_per_gres(1 << 40).finish()].into();
        let mut list = vec![sock_record(0, 0).total_cnt(4).finish()];
        let core_bitmap = cores(8, &[0]);
        assert!(remove_unusable(&mut list, &jobs, &base_params(&core_bitmap)).is_ok());
    }

    #[test]
    fn test_filter_memory_caps_node_gres() {
        let jobs = vec![job_state("gpu").per_node(1).mem_per_gres(1024).finish()].into();
        let mut list = vec![sock_record(0, 0).total_cnt(4).finish()];
        let core_bitmap = cores(8, &[0, 1]);
        let params = NodeFilterParams {
            avail_mem: Some(3 * 1024),
            ..base_params(&core_bitmap)
        };
        remove_unusable(&mut list, &jobs, &params).unwrap();
        assert_eq!(list[0].total_cnt, 3);
        // per_node = 1 wins over the memory cap of 3
        assert_eq!(list[0].max_node_gres, 1);
    }

    #[test]
    fn test_filter_insufficient_count() {
        let jobs = vec![job_state("gpu").per_node(4).finish()].into();
        let mut list = vec![sock_record(0, 0).total_cnt(2).finish()];
        let core_bitmap = cores(8, &[0]);
        let err = remove_unusable(&mut list, &jobs, &base_params(&core_bitmap)).unwrap_err();
        assert!(matches!(err, SelectError::InsufficientCount));
    }

    #[test]
    fn test_filter_enforce_binding_prunes_socket() {
        // 2 sockets, 2 GPUs each; socket 0 has no available core.
        let jobs = vec![job_state("gpu").sharing().per_socket(1).finish()].into();
        let mut list = vec![sock_record(0, 0)
            .total_cnt(4)
            .sock_cnt(2)
            .cnt_by_sock(vec![2, 2])
            .finish()];
        let core_bitmap = cores(8, &[5, 6]);
        let params = NodeFilterParams {
            enforce_binding: true,
            ..base_params(&core_bitmap)
        };
        let counts = remove_unusable(&mut list, &jobs, &params).unwrap();
        assert_eq!(list[0].total_cnt, 2);
        assert_eq!(list[0].cnt_by_sock.as_ref().unwrap()[0], 0);
        assert_eq!(list[0].cnt_by_sock.as_ref().unwrap()[1], 2);
        assert_eq!(counts.avail_gpus, 2);
        assert_eq!(counts.near_gpus, 2);
    }

    #[test]
    fn test_filter_no_binding_keeps_buckets() {
        let jobs = vec![job_state("gpu").sharing().per_node(1).finish()].into();
        let mut list = vec![sock_record(0, 0)
            .total_cnt(4)
            .sock_cnt(2)
            .cnt_by_sock(vec![2, 2])
            .finish()];
        let core_bitmap = cores(8, &[5, 6]);
        let counts = remove_unusable(&mut list, &jobs, &base_params(&core_bitmap)).unwrap();
        assert_eq!(list[0].total_cnt, 4);
        assert_eq!(list[0].cnt_by_sock.as_ref().unwrap(), &vec![2, 2]);
        assert_eq!(counts.avail_gpus, 4);
        // max_node_gres = per_node = 1 caps the near count
        assert_eq!(counts.near_gpus, 1);
    }

    #[test]
    fn test_filter_near_gpus_saturates() {
        let jobs: GresJobTable = vec![job_state("gpu").sharing().per_node(200).finish()].into();
        let mut list: Vec<SockGres> = (0..3)
            .map(|_| sock_record(0, 0).total_cnt(200).finish())
            .collect();
        let core_bitmap = cores(8, &[0]);
        let counts = remove_unusable(&mut list, &jobs, &base_params(&core_bitmap)).unwrap();
        assert_eq!(counts.near_gpus, 0xff);
        assert_eq!(counts.avail_gpus, 600);
    }

    #[test]
    fn test_filter_min_gres_multipliers() {
        // gres_per_socket * sock_per_node exceeds what the node offers.
        let jobs = vec![job_state("gpu").per_socket(2).finish()].into();
        let mut list = vec![sock_record(0, 0).total_cnt(3).finish()];
        let core_bitmap = cores(8, &[0]);
        let params = NodeFilterParams {
            sock_per_node: Some(2),
            ..base_params(&core_bitmap)
        };
        let err = remove_unusable(&mut list, &jobs, &params).unwrap_err();
        assert!(matches!(err, SelectError::InsufficientCount));

        // Without the multiplier the request fits.
        let mut list = vec![sock_record(0, 0).total_cnt(3).finish()];
        assert!(remove_unusable(&mut list, &jobs, &base_params(&core_bitmap)).is_ok());
    }

    #[test]
    fn test_filter_whole_node_skips_job_cap() {
        let jobs = vec![job_state("gpu").per_job(2).finish()].into();
        let mut list = vec![sock_record(0, 0).total_cnt(4).finish()];
        let core_bitmap = cores(8, &[0]);
        let params = NodeFilterParams {
            whole_node: true,
            ..base_params(&core_bitmap)
        };
        remove_unusable(&mut list, &jobs, &params).unwrap();
        assert_eq!(list[0].max_node_gres, 0);

        let mut list = vec![sock_record(0, 0).total_cnt(4).finish()];
        remove_unusable(&mut list, &jobs, &base_params(&core_bitmap)).unwrap();
        assert_eq!(list[0].max_node_gres, 2);
    }

    #[test]
    fn test_avail_cores_by_sock() {
        let core_bitmap = cores(8, &[1, 6]);
        let avail = avail_cores_by_sock(&core_bitmap, 2, 4);
        assert_eq!(avail.as_slice(), &[true, true]);

        let core_bitmap = cores(8, &[6]);
        let avail = avail_cores_by_sock(&core_bitmap, 2, 4);
        assert_eq!(avail.as_slice(), &[false, true]);

        // Bitmap shorter than the geometry stops the scan.
        let core_bitmap = cores(4, &[1]);
        let avail = avail_cores_by_sock(&core_bitmap, 2, 4);
        assert_eq!(avail.as_slice(), &[true, false]);
    }
}
