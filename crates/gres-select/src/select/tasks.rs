use crate::gres::{JobRecord, McOptions, NodeRecord};

/// Task count a node's socket row accounts for. A missing layout is
/// reported and answered with a best guess of one task.
pub(crate) fn task_cnt_on_node(tasks_per_socket: &[u32]) -> u32 {
    if tasks_per_socket.is_empty() {
        log::error!("tasks_per_socket is unset");
        return 1;
    }
    tasks_per_socket.iter().sum()
}

/// Build the task count for each (node, socket) pair from the job's
/// committed allocation, walking allocated cores socket-major and honoring
/// the per-node, per-socket and per-core task limits. Rows are indexed by
/// global node index; unallocated nodes keep empty rows.
pub(crate) fn build_tasks_per_node_socket(
    job: &JobRecord,
    node_table: &[NodeRecord],
    mc: &McOptions,
) -> Vec<Vec<u32>> {
    let job_res = &job.resources;
    let node_cnt = job_res.node_cnt();
    let mut tasks_per_node_socket: Vec<Vec<u32>> = vec![Vec::new(); node_cnt];
    let mut rem_tasks = mc.ntasks_per_job as i64;
    let cpus_per_task = mc.cpus_per_task.max(1) as usize;

    let mut job_node_inx = 0;
    for i in job_res.node_bitmap.iter_set() {
        let mut tasks_per_node: i64 = 0;
        let Some((sock_cnt, cores_per_socket_cnt)) = job_res.geometry(job_node_inx) else {
            log::error!("failed to get socket/core count for node {}", i);
            // Fall back to a single task on socket 0
            tasks_per_node_socket[i] = vec![1];
            rem_tasks -= 1;
            continue;
        };
        tasks_per_node_socket[i] = vec![0; sock_cnt];

        let task_per_node_limit: i64;
        if mc.ntasks_per_node != 0 {
            task_per_node_limit = mc.ntasks_per_node as i64;
        } else if job_res
            .tasks_per_node
            .get(job_node_inx)
            .is_some_and(|&t| t != 0)
        {
            task_per_node_limit = job_res.tasks_per_node[job_node_inx] as i64;
        } else {
            // The committed allocation normally records a task count; fall
            // back to the CPUs the job uses on this node.
            log::error!("tasks_per_node not set for node {}", i);
            let cpus_per_node = job_res.cpus(job_node_inx).unwrap_or(0);
            if cpus_per_node < 1 {
                log::error!("failed to get cpus_per_node count for node {}", i);
                tasks_per_node_socket[i] = vec![1];
                rem_tasks -= 1;
                continue;
            }
            task_per_node_limit = cpus_per_node as i64 / cpus_per_task as i64;
        }

        let core_offset = job_res.core_offset(job_node_inx);
        job_node_inx += 1;
        let Some(core_offset) = core_offset else {
            log::error!("invalid core offset for node {}", i);
            continue;
        };
        let cpus_per_core = node_table[i].tpc.max(1) as usize;

        'sockets: for s in 0..sock_cnt {
            let mut tasks_per_socket: i64 = 0;
            let mut skip_cores = 0usize;
            for c in 0..cores_per_socket_cnt {
                let j = core_offset + s * cores_per_socket_cnt + c;
                if !job_res.core_bitmap.test(j) {
                    continue;
                }
                if skip_cores > 0 {
                    skip_cores -= 1;
                    continue;
                }
                let tpc: i64 = if mc.ntasks_per_core != 0 {
                    mc.ntasks_per_core as i64
                } else {
                    let mut tpc = (cpus_per_core / cpus_per_task) as i64;
                    if tpc < 1 {
                        tpc = 1;
                        // A task wider than a core consumes the following
                        // cores of this socket as well.
                        skip_cores = cpus_per_task.div_ceil(cpus_per_core) - 1;
                    }
                    tpc
                };
                tasks_per_node_socket[i][s] += tpc as u32;
                tasks_per_node += tpc;
                tasks_per_socket += tpc;
                rem_tasks -= tpc;
                if task_per_node_limit != 0 {
                    if tasks_per_node > task_per_node_limit {
                        let excess = tasks_per_node - task_per_node_limit;
                        tasks_per_node_socket[i][s] -= excess as u32;
                        rem_tasks += excess;
                    }
                    if tasks_per_node >= task_per_node_limit {
                        break 'sockets;
                    }
                }
                if mc.ntasks_per_socket != 0 {
                    if tasks_per_socket > mc.ntasks_per_socket as i64 {
                        let excess = tasks_per_socket - mc.ntasks_per_socket as i64;
                        tasks_per_node_socket[i][s] -= excess as u32;
                        rem_tasks += excess;
                    }
                    if tasks_per_socket >= mc.ntasks_per_socket as i64 {
                        break;
                    }
                }
            }
        }
    }

    // With overcommit, spread the remaining tasks one at a time over the
    // first allocated core of every socket until none remain.
    while rem_tasks > 0 && job.overcommit {
        let mut placed_any = false;
        let mut job_node_inx = 0;
        for i in job_res.node_bitmap.iter_set() {
            if rem_tasks <= 0 {
                break;
            }
            let Some((sock_cnt, cores_per_socket_cnt)) = job_res.geometry(job_node_inx) else {
                continue;
            };
            let Some(core_offset) = job_res.core_offset(job_node_inx) else {
                continue;
            };
            job_node_inx += 1;
            for s in 0..sock_cnt {
                if rem_tasks <= 0 {
                    break;
                }
                for c in 0..cores_per_socket_cnt {
                    let j = core_offset + s * cores_per_socket_cnt + c;
                    if !job_res.core_bitmap.test(j) {
                        continue;
                    }
                    if let Some(slot) = tasks_per_node_socket[i].get_mut(s) {
                        *slot += 1;
                        rem_tasks -= 1;
                        placed_any = true;
                    }
                    break;
                }
            }
        }
        if !placed_any {
            break;
        }
    }
    if rem_tasks > 0 {
        log::error!("rem_tasks not zero ({} > 0)", rem_tasks);
    }

    tasks_per_node_socket
}
