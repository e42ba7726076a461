use crate::common::error::SelectError;
use crate::gres::{
    GresJobState, GresNodeState, JobId, SelectParams, SockGres, SockTarget,
};
use crate::select::tasks::task_cnt_on_node;

/// Topology slots ordered least-loaded first: by descending ratio of free
/// to total capacity. Integer arithmetic only; scaling by the node's total
/// capacity is the smallest factor that keeps distinct ratios apart.
pub(crate) fn sorted_topo_by_least_loaded(gres_ns: &GresNodeState) -> Vec<usize> {
    let topo_cnt = gres_ns.topo_cnt;
    let mut nonalloc_gres: Vec<i64> = vec![0; topo_cnt];
    for t in 0..topo_cnt {
        let avail = gres_ns.topo_gres_cnt_avail.get(t).copied().unwrap_or(0);
        if avail == 0 {
            continue;
        }
        let mut free = avail as i64 - gres_ns.topo_gres_cnt_alloc.get(t).copied().unwrap_or(0) as i64;
        free *= gres_ns.cnt_avail as i64;
        free /= avail as i64;
        nonalloc_gres[t] = free;
    }
    let mut topo_index: Vec<usize> = (0..topo_cnt).collect();
    topo_index.sort_by(|a, b| nonalloc_gres[*b].cmp(&nonalloc_gres[*a]));
    topo_index
}

/// Draw up to `*gres_needed` fractional units from topology slots
/// reachable from the given socket.
#[allow(clippy::too_many_arguments)]
pub(crate) fn pick_shared_gres_topo(
    sock_gres: &SockGres,
    gres_js: &mut GresJobState,
    gres_ns: &GresNodeState,
    use_busy_dev: bool,
    use_single_dev: bool,
    no_repeat: bool,
    node_inx: usize,
    target: SockTarget,
    gres_needed: &mut u64,
    topo_index: Option<&[usize]>,
) {
    let Some(sock_bits) = sock_gres.sock_bits(target) else {
        return;
    };

    if gres_ns.topo_gres_cnt_alloc.len() < gres_ns.topo_cnt
        || gres_ns.topo_gres_cnt_avail.len() < gres_ns.topo_cnt
    {
        log::error!("topology usage counters not set; this should never happen");
        return;
    }

    for j in 0..gres_ns.topo_cnt {
        if *gres_needed == 0 {
            break;
        }
        let t = topo_index.map_or(j, |order| order[j]);
        if gres_js.type_id != 0 && gres_js.type_id != gres_ns.topo_type(t) {
            continue;
        }
        if use_busy_dev && gres_ns.topo_gres_cnt_alloc[t] == 0 {
            continue;
        }
        let drawn = gres_js.per_bit_select[node_inx]
            .as_ref()
            .and_then(|d| d.get(t).copied())
            .unwrap_or(0);
        let cnt_avail = gres_ns.topo_gres_cnt_avail[t]
            .saturating_sub(gres_ns.topo_gres_cnt_alloc[t])
            .saturating_sub(drawn);
        if cnt_avail < if use_single_dev { *gres_needed } else { 1 } {
            continue; // Insufficient resources
        }
        if !sock_bits.test(t) {
            continue; // GRES not on this socket
        }
        let Some(bit_select) = gres_js.bit_select[node_inx].as_mut() else {
            return;
        };
        if no_repeat && bit_select.test(t) {
            continue;
        }

        let cnt_to_alloc = cnt_avail.min(*gres_needed);
        if cnt_to_alloc == 0 {
            continue;
        }

        bit_select.set(t);
        gres_js.cnt_node_select[node_inx] += cnt_to_alloc;
        if let Some(drawn) = gres_js.per_bit_select[node_inx]
            .as_mut()
            .and_then(|d| d.get_mut(t))
        {
            *drawn += cnt_to_alloc;
        }
        *gres_needed -= cnt_to_alloc;
    }
}

/// Three-pass shared draw: sockets the job runs on, then slots without
/// socket affinity, then (unless binding is enforced) the remaining
/// sockets.
#[allow(clippy::too_many_arguments)]
pub(crate) fn pick_shared_gres(
    gres_needed: &mut u64,
    used_sock: &[u32],
    sock_gres: &SockGres,
    gres_js: &mut GresJobState,
    gres_ns: &GresNodeState,
    node_inx: usize,
    use_busy_dev: bool,
    use_single_dev: bool,
    no_repeat: bool,
    enforce_binding: bool,
    params: SelectParams,
) {
    let topo_index = params
        .contains(SelectParams::LL_SHARED_GRES)
        .then(|| sorted_topo_by_least_loaded(gres_ns));

    for s in 0..sock_gres.sock_cnt {
        if *gres_needed == 0 {
            break;
        }
        if used_sock.get(s).copied().unwrap_or(0) == 0 {
            continue;
        }
        pick_shared_gres_topo(
            sock_gres,
            gres_js,
            gres_ns,
            use_busy_dev,
            use_single_dev,
            no_repeat,
            node_inx,
            SockTarget::Socket(s),
            gres_needed,
            topo_index.as_deref(),
        );
    }

    if *gres_needed > 0 {
        pick_shared_gres_topo(
            sock_gres,
            gres_js,
            gres_ns,
            use_busy_dev,
            use_single_dev,
            no_repeat,
            node_inx,
            SockTarget::Any,
            gres_needed,
            topo_index.as_deref(),
        );
    }

    if *gres_needed > 0 && !enforce_binding {
        // Only the sockets skipped above
        for s in 0..sock_gres.sock_cnt {
            if *gres_needed == 0 {
                break;
            }
            if used_sock.get(s).copied().unwrap_or(0) != 0 {
                continue;
            }
            pick_shared_gres_topo(
                sock_gres,
                gres_js,
                gres_ns,
                use_busy_dev,
                use_single_dev,
                no_repeat,
                node_inx,
                SockTarget::Socket(s),
                gres_needed,
                topo_index.as_deref(),
            );
        }
    }
}

/// Per-node shared draw: prefer one sharing device with enough capacity
/// for the whole count; spill over to multiple devices only when policy
/// allows it.
pub(crate) fn set_shared_node_bits(
    sock_gres: &SockGres,
    gres_js: &mut GresJobState,
    gres_ns: &GresNodeState,
    node_inx: usize,
    enforce_binding: bool,
    used_sock: &[u32],
    params: SelectParams,
) -> crate::Result<()> {
    let use_busy_dev = gres_ns.use_busy_dev();
    let mut gres_needed = gres_js.per_node;

    pick_shared_gres(
        &mut gres_needed,
        used_sock,
        sock_gres,
        gres_js,
        gres_ns,
        node_inx,
        use_busy_dev,
        true,
        false,
        enforce_binding,
        params,
    );

    if gres_needed > 0 && params.contains(SelectParams::MULTIPLE_SHARING_GRES_PJ) {
        pick_shared_gres(
            &mut gres_needed,
            used_sock,
            sock_gres,
            gres_js,
            gres_ns,
            node_inx,
            use_busy_dev,
            false,
            false,
            enforce_binding,
            params,
        );
    }

    if gres_needed > 0 {
        log::error!("not enough shared gres/{} available to satisfy the per-node request", gres_js.name);
        return Err(SelectError::InvalidGres(format!(
            "per-node shared gres/{} request unsatisfiable",
            gres_js.name
        )));
    }
    Ok(())
}

/// Per-task shared draw. Without MULTIPLE_SHARING_GRES_PJ the entire
/// job's task demand must come from one sharing device; with it, each
/// task draws from its own socket, optionally never repeating a device.
#[allow(clippy::too_many_arguments)]
pub(crate) fn set_shared_task_bits(
    sock_gres: &SockGres,
    gres_js: &mut GresJobState,
    gres_ns: &GresNodeState,
    node_inx: usize,
    job_id: JobId,
    node_name: &str,
    enforce_binding: bool,
    no_task_sharing: bool,
    tasks_per_socket: &[u32],
    params: SelectParams,
) -> crate::Result<()> {
    if tasks_per_socket.is_empty() {
        log::error!(
            "tasks_per_socket unset for job {} on node {}",
            job_id,
            node_name
        );
        return Err(SelectError::InvalidTaskLayout(format!(
            "tasks_per_socket unset on node {node_name}"
        )));
    }

    let use_busy_dev = gres_ns.use_busy_dev();

    if !params.contains(SelectParams::MULTIPLE_SHARING_GRES_PJ) {
        // Allow only one sharing device for the entire job
        let mut gres_needed =
            gres_js.per_task * task_cnt_on_node(tasks_per_socket) as u64;
        if no_task_sharing {
            log::error!(
                "one-task-per-sharing requires MULTIPLE_SHARING_GRES_PJ to be set; ignoring"
            );
        }
        pick_shared_gres(
            &mut gres_needed,
            tasks_per_socket,
            sock_gres,
            gres_js,
            gres_ns,
            node_inx,
            use_busy_dev,
            true,
            false,
            enforce_binding,
            params,
        );
        if gres_needed > 0 {
            log::error!(
                "not enough shared gres/{} available on one sharing device to satisfy the per-task request",
                gres_js.name
            );
            return Err(SelectError::InvalidGres(format!(
                "per-task shared gres/{} request unsatisfiable",
                gres_js.name
            )));
        }
        Ok(())
    } else {
        // Allow only one sharing device per task
        let mut result = Ok(());
        let mut used_sock = vec![0u32; sock_gres.sock_cnt];
        for s in 0..sock_gres.sock_cnt {
            used_sock[s] = 1;
            for _ in 0..tasks_per_socket.get(s).copied().unwrap_or(0) {
                let mut gres_needed = gres_js.per_task;
                pick_shared_gres(
                    &mut gres_needed,
                    &used_sock,
                    sock_gres,
                    gres_js,
                    gres_ns,
                    node_inx,
                    use_busy_dev,
                    true,
                    no_task_sharing,
                    enforce_binding,
                    params,
                );
                if gres_needed > 0 {
                    log::error!(
                        "not enough shared gres/{} available to satisfy the per-task request",
                        gres_js.name
                    );
                    if result.is_ok() {
                        result = Err(SelectError::InvalidGres(format!(
                            "per-task shared gres/{} request unsatisfiable",
                            gres_js.name
                        )));
                    }
                    break;
                }
            }
            used_sock[s] = 0;
        }
        result
    }
}
