pub mod filter;
pub(crate) mod shared;
pub(crate) mod tasks;
pub(crate) mod topo;

pub use filter::{remove_unusable, FilteredCounts, NodeFilterParams};

use crate::common::error::SelectError;
use crate::gres::{
    GresJobState, GresJobTable, GresNodeState, GresNodeTable, JobGresFlags, JobRecord, JobResources,
    McOptions, NodeRecord, SelectParams, SockGres,
};
use crate::select::tasks::{build_tasks_per_node_socket, task_cnt_on_node};

/// Allocated-core statistics of one node of the job's allocation.
struct NodeUsage {
    used_cores_on_sock: Vec<u32>,
    used_core_cnt: u32,
    used_sock_cnt: u32,
}

/// Count the allocated cores of each socket on the job's n-th node.
fn set_used_cnts(job_res: &JobResources, job_node_inx: usize) -> crate::Result<NodeUsage> {
    let Some((sock_cnt, cores_per_socket_cnt)) = job_res.geometry(job_node_inx) else {
        log::error!("invalid socket/core count");
        return Err(SelectError::Internal(
            "invalid socket/core count in job resources".to_string(),
        ));
    };
    let Some(core_offset) = job_res.core_offset(job_node_inx) else {
        log::error!("invalid core offset");
        return Err(SelectError::Internal(
            "invalid core offset in job resources".to_string(),
        ));
    };

    let mut usage = NodeUsage {
        used_cores_on_sock: Vec::with_capacity(sock_cnt),
        used_core_cnt: 0,
        used_sock_cnt: 0,
    };
    for socket_inx in 0..sock_cnt {
        let begin = core_offset + socket_inx * cores_per_socket_cnt;
        let core_cnt = job_res
            .core_bitmap
            .count_range(begin, begin + cores_per_socket_cnt) as u32;
        usage.used_cores_on_sock.push(core_cnt);
        usage.used_core_cnt += core_cnt;
        if core_cnt > 0 {
            usage.used_sock_cnt += 1;
        }
    }

    if usage.used_sock_cnt == 0 {
        log::error!("no allocated cores found");
        return Err(SelectError::Internal(
            "no allocated cores found for node".to_string(),
        ));
    }
    Ok(usage)
}

/// Count of GRES units on this node. The committed-allocation bitmap is
/// authoritative; topologies that omit it fall back to the slot bitmaps,
/// then to the summed slot capacities.
fn gres_node_cnt(gres_ns: &GresNodeState) -> usize {
    if let Some(bit_alloc) = &gres_ns.bit_alloc {
        return bit_alloc.len();
    }
    if let Some(bits) = gres_ns.topo_gres_bitmap.first().and_then(|b| b.as_ref()) {
        return bits.len();
    }
    gres_ns.topo_gres_cnt_avail.iter().sum::<u64>() as usize
}

/// Maximum per-job draw on a node without topology, leaving one unit per
/// remaining node. A deficit wraps and the free count wins the min.
fn get_job_cnt(gres_js: &GresJobState, gres_ns: &GresNodeState, rem_node_cnt: usize) -> u64 {
    let avail_gres = gres_ns.cnt_avail.saturating_sub(gres_ns.cnt_alloc);
    let max_gres = gres_js
        .per_job
        .wrapping_sub(gres_js.total_gres)
        .wrapping_sub(rem_node_cnt as u64 - 1);
    avail_gres.min(max_gres)
}

struct SelectContext<'a> {
    job: &'a JobRecord,
    node_table: &'a [NodeRecord],
    mc: &'a McOptions,
    params: SelectParams,
    node_cnt: usize,
    tasks_per_node_socket: Option<Vec<Vec<u32>>>,
    /// -1: no per-job kind seen, 0: per-job counter still unmet, 1: met.
    job_fini: i32,
    usage: Option<NodeUsage>,
}

#[allow(clippy::too_many_arguments)]
fn select_and_set_node(
    sock_gres: &SockGres,
    jobs: &mut GresJobTable,
    nodes: &GresNodeTable,
    ctx: &mut SelectContext<'_>,
    node_inx: usize,
    job_node_inx: usize,
    rem_node_cnt: usize,
) -> crate::Result<()> {
    let job_res = &ctx.job.resources;
    let gres_js = &mut jobs[sock_gres.job];
    let gres_ns = &nodes[sock_gres.node];
    let node_ptr = &ctx.node_table[node_inx];
    let job_id = ctx.job.id;
    let enforce_binding = ctx.job.flags.contains(JobGresFlags::ENFORCE_BINDING);

    if (gres_js.per_node != 0 || gres_js.per_socket != 0 || gres_js.per_job != 0)
        && ctx.usage.is_none()
    {
        ctx.usage = Some(set_used_cnts(job_res, job_node_inx)?);
    }
    if gres_js.per_task != 0 && ctx.tasks_per_node_socket.is_none() {
        ctx.tasks_per_node_socket = Some(build_tasks_per_node_socket(
            ctx.job,
            ctx.node_table,
            ctx.mc,
        ));
    }

    if gres_js.total_node_cnt == 0 {
        gres_js.total_node_cnt = ctx.node_cnt as u32;
        gres_js.total_gres = 0;
    }
    gres_js.ensure_cnt_node_select(ctx.node_cnt);

    // Reinitialize the job-wide counter on the first allocated node
    if Some(node_inx) == job_res.node_bitmap.first_set() {
        gres_js.total_gres = 0;
    }

    if !gres_ns.has_topo() {
        // No topology, just set a count
        if gres_js.per_node != 0 {
            gres_js.cnt_node_select[node_inx] = gres_js.per_node;
        } else if gres_js.per_socket != 0 {
            let used_sock_cnt = ctx.usage.as_ref().map_or(0, |u| u.used_sock_cnt);
            gres_js.cnt_node_select[node_inx] = gres_js.per_socket * used_sock_cnt as u64;
        } else if gres_js.per_task != 0 {
            let tasks = ctx
                .tasks_per_node_socket
                .as_ref()
                .map_or(1, |t| task_cnt_on_node(&t[node_inx]));
            gres_js.cnt_node_select[node_inx] = gres_js.per_task * tasks as u64;
        } else if gres_js.per_job != 0 {
            gres_js.cnt_node_select[node_inx] = get_job_cnt(gres_js, gres_ns, rem_node_cnt);
        }
        gres_js.total_gres += gres_js.cnt_node_select[node_inx];
        return Ok(());
    }

    // Working with topology, need to pick specific GRES
    gres_js.ensure_bit_select(ctx.node_cnt);
    let gres_cnt = gres_node_cnt(gres_ns);
    gres_js.bit_select[node_inx] = Some(crate::common::Bitmap::new(gres_cnt));
    gres_js.cnt_node_select[node_inx] = 0;

    if gres_js.is_shared() {
        gres_js.init_per_bit_select(node_inx);
        if gres_js.per_node != 0 {
            let used_sock = ctx
                .usage
                .as_ref()
                .map(|u| u.used_cores_on_sock.as_slice())
                .unwrap_or(&[]);
            shared::set_shared_node_bits(
                sock_gres,
                gres_js,
                gres_ns,
                node_inx,
                enforce_binding,
                used_sock,
                ctx.params,
            )?;
        } else if gres_js.per_task != 0 {
            let tasks_row = ctx
                .tasks_per_node_socket
                .as_ref()
                .map(|t| t[node_inx].as_slice())
                .unwrap_or(&[]);
            shared::set_shared_task_bits(
                sock_gres,
                gres_js,
                gres_ns,
                node_inx,
                job_id,
                &node_ptr.name,
                enforce_binding,
                ctx.job.flags.contains(JobGresFlags::ONE_TASK_PER_SHARING),
                tasks_row,
                ctx.params,
            )?;
        } else {
            log::error!(
                "job {} request lacks a valid shared gres/{} counter",
                job_id,
                gres_js.name
            );
            return Err(SelectError::InvalidGres(format!(
                "shared gres/{} requires a per-node or per-task count",
                gres_js.name
            )));
        }
    } else if gres_js.per_node != 0 {
        let used_sock = ctx
            .usage
            .as_ref()
            .map(|u| u.used_cores_on_sock.as_slice())
            .unwrap_or(&[]);
        topo::set_node_bits(sock_gres, gres_js, gres_ns, node_inx, used_sock);
    } else if gres_js.per_socket != 0 {
        let (used_sock, used_sock_cnt) = ctx
            .usage
            .as_ref()
            .map(|u| (u.used_cores_on_sock.as_slice(), u.used_sock_cnt))
            .unwrap_or((&[], 0));
        topo::set_sock_bits(
            sock_gres,
            gres_js,
            gres_ns,
            node_inx,
            job_id,
            ctx.mc,
            used_sock,
            used_sock_cnt,
        );
    } else if gres_js.per_task != 0 {
        let tasks_row = ctx
            .tasks_per_node_socket
            .as_ref()
            .map(|t| t[node_inx].as_slice())
            .unwrap_or(&[]);
        topo::set_task_bits(
            sock_gres,
            gres_js,
            gres_ns,
            node_inx,
            job_id,
            &node_ptr.name,
            tasks_row,
        );
    } else if gres_js.per_job != 0 {
        let (used_sock, used_core_cnt) = ctx
            .usage
            .as_ref()
            .map(|u| (u.used_cores_on_sock.as_slice(), u.used_core_cnt))
            .unwrap_or((&[], 0));
        let fini = topo::set_job_bits1(
            sock_gres,
            gres_js,
            gres_ns,
            node_inx,
            job_node_inx,
            rem_node_cnt,
            job_id,
            ctx.mc,
            node_ptr.tpc,
            used_sock,
            used_core_cnt,
        );
        if ctx.job_fini != 0 {
            ctx.job_fini = fini;
        }
    } else {
        log::error!(
            "job {} request lacks a gres/{} counter",
            job_id,
            gres_js.name
        );
    }

    if ctx.job_fini == -1 {
        // The per-job first pass maintains total_gres itself; every other
        // strategy accumulates here.
        gres_js.total_gres += gres_js.cnt_node_select[node_inx];
    }
    Ok(())
}

/// Make the final GRES selection for the job: for every allocated node and
/// every requested kind, decide the exact units (or plain counts when the
/// node reports no topology) and record them on the job's GRES state.
///
/// `sock_gres_per_node` holds one record list per allocated node, in job
/// node order; `node_table` is the cluster node table indexed by global
/// node index and must cover the job's node bitmap.
pub fn select_and_set(
    sock_gres_per_node: &[Vec<SockGres>],
    jobs: &mut GresJobTable,
    nodes: &GresNodeTable,
    job: &JobRecord,
    node_table: &[NodeRecord],
    mc: &McOptions,
    params: SelectParams,
) -> crate::Result<()> {
    let job_res = &job.resources;
    let node_cnt = job_res.node_cnt();
    let mut rem_node_cnt = job_res.node_bitmap.count();
    let mut ctx = SelectContext {
        job,
        node_table,
        mc,
        params,
        node_cnt,
        tasks_per_node_socket: None,
        job_fini: -1,
        usage: None,
    };

    let mut job_node_inx = 0;
    for node_inx in job_res.node_bitmap.iter_set() {
        ctx.usage = None;
        let Some(sock_gres_list) = sock_gres_per_node.get(job_node_inx) else {
            return Err(SelectError::Internal(format!(
                "missing sock_gres list for job node {job_node_inx}"
            )));
        };
        for sock_gres in sock_gres_list {
            select_and_set_node(
                sock_gres,
                jobs,
                nodes,
                &mut ctx,
                node_inx,
                job_node_inx,
                rem_node_cnt,
            )?;
        }
        job_node_inx += 1;
        rem_node_cnt -= 1;
    }

    if ctx.job_fini == 0 {
        // The per-job counter is still unmet; sweep again taking GRES off
        // sockets the job did not allocate, which the first pass avoids.
        let mut job_node_inx = 0;
        let mut job_fini = -1;
        for node_inx in job_res.node_bitmap.iter_set() {
            job_fini = -1;
            for sock_gres in &sock_gres_per_node[job_node_inx] {
                let gres_js = &mut jobs[sock_gres.job];
                let gres_ns = &nodes[sock_gres.node];
                let fini = topo::set_job_bits2(sock_gres, gres_js, gres_ns, node_inx, job.id);
                if job_fini != 0 {
                    job_fini = i32::from(fini);
                }
            }
            job_node_inx += 1;
            if job_fini == 1 {
                break;
            }
        }
        if job_fini == 0 {
            log::error!("job {} failed to satisfy the gres-per-job counter", job.id);
            return Err(SelectError::NodeNotAvailable);
        }
    }

    Ok(())
}
