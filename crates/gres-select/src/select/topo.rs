use crate::gres::{
    GresJobState, GresNodeState, JobId, McOptions, SockGres, SockTarget,
};
use crate::select::tasks::task_cnt_on_node;

/// Accumulated link counts and the candidate scan order they induce.
/// Rebuilt per selection; the sort key is bound through this state, never
/// shared between calls.
pub(crate) struct LinkState {
    links: Vec<i64>,
    sorted: Vec<usize>,
}

impl LinkState {
    fn new(gres_cnt: usize) -> Self {
        LinkState {
            links: vec![0; gres_cnt],
            sorted: (0..gres_cnt).collect(),
        }
    }

    /// Link-guided ordering is only meaningful when the node reports a
    /// full link matrix for this kind.
    pub(crate) fn for_node(gres_ns: &GresNodeState, gres_cnt: usize) -> Option<Self> {
        gres_ns.links_usable(gres_cnt).then(|| Self::new(gres_cnt))
    }

    /// Seed the counts from every unit already chosen on this node, then
    /// order candidates by best connectivity.
    pub(crate) fn seeded(
        gres_ns: &GresNodeState,
        chosen: impl Iterator<Item = usize>,
        gres_cnt: usize,
    ) -> Self {
        let mut state = Self::new(gres_cnt);
        for g in chosen {
            for l in 0..gres_cnt {
                if l == g || gres_ns.bit_alloc_test(l) {
                    continue;
                }
                state.links[l] += gres_ns.link(g, l);
            }
        }
        state.resort();
        state
    }

    /// Accumulate links from the unit just selected and re-sort.
    fn update_and_sort(&mut self, gres_inx: usize, gres_ns: &GresNodeState) {
        for l in 0..self.links.len() {
            if l == gres_inx || gres_ns.bit_alloc_test(l) {
                continue;
            }
            self.links[l] += gres_ns.link(gres_inx, l);
        }
        self.resort();
    }

    fn resort(&mut self) {
        let links = &self.links;
        // Most linked first; stable, so ties keep their candidate order.
        self.sorted.sort_by(|a, b| links[*b].cmp(&links[*a]));
    }
}

/// Set up to `gres_needed` free units reachable from the given socket,
/// returning how many were set.
///
/// Candidates are scanned in link order when `link_state` is given; after
/// every selection the order is recomputed from the enlarged selection and
/// the scan restarts from the most-linked candidate.
pub(crate) fn pick_gres_topo(
    sock_gres: &SockGres,
    gres_js: &mut GresJobState,
    gres_ns: &GresNodeState,
    gres_needed: u64,
    node_inx: usize,
    target: SockTarget,
    mut link_state: Option<&mut LinkState>,
) -> u64 {
    let Some(sock_bits) = sock_gres.sock_bits(target) else {
        return 0;
    };
    let Some(bit_select) = gres_js.bit_select[node_inx].as_mut() else {
        return 0;
    };
    let gres_cnt = bit_select.len();
    let mut still_needed = gres_needed;

    if let Some(link_state) = link_state.as_deref_mut() {
        let mut rescan = still_needed > 0;
        while rescan {
            rescan = false;
            for i in 0..gres_cnt {
                let g = link_state.sorted[i];
                if !sock_bits.test(g) {
                    continue;
                }
                if bit_select.test(g) || gres_ns.bit_alloc_test(g) {
                    continue;
                }
                bit_select.set(g);
                gres_js.cnt_node_select[node_inx] += 1;
                still_needed -= 1;
                link_state.update_and_sort(g, gres_ns);
                rescan = still_needed > 0;
                break;
            }
        }
    } else {
        for g in 0..gres_cnt {
            if still_needed == 0 {
                break;
            }
            if !sock_bits.test(g) {
                continue;
            }
            if bit_select.test(g) || gres_ns.bit_alloc_test(g) {
                continue;
            }
            bit_select.set(g);
            gres_js.cnt_node_select[node_inx] += 1;
            still_needed -= 1;
        }
    }

    gres_needed - still_needed
}

/// Per-node selection: one unit per allocated socket first, then more
/// from allocated sockets, then anything else on the node.
pub(crate) fn set_node_bits(
    sock_gres: &SockGres,
    gres_js: &mut GresJobState,
    gres_ns: &GresNodeState,
    node_inx: usize,
    used_sock: &[u32],
) {
    let sock_cnt = sock_gres.sock_cnt;
    let gres_cnt = gres_js.bit_select[node_inx]
        .as_ref()
        .map_or(0, |b| b.len());
    let mut gres_needed = gres_js.per_node;
    let mut link_state = LinkState::for_node(gres_ns, gres_cnt);

    for s in 0..sock_cnt {
        if gres_needed == 0 {
            break;
        }
        if used_sock.get(s).copied().unwrap_or(0) == 0 {
            continue;
        }
        gres_needed -= pick_gres_topo(
            sock_gres,
            gres_js,
            gres_ns,
            1,
            node_inx,
            SockTarget::Socket(s),
            link_state.as_mut(),
        );
    }
    if gres_needed > 0 {
        gres_needed -= pick_gres_topo(
            sock_gres,
            gres_js,
            gres_ns,
            1,
            node_inx,
            SockTarget::Any,
            link_state.as_mut(),
        );
    }

    // Favor units best linked to the ones already selected.
    for s in 0..sock_cnt {
        if gres_needed == 0 {
            break;
        }
        if used_sock.get(s).copied().unwrap_or(0) == 0 {
            continue;
        }
        gres_needed -= pick_gres_topo(
            sock_gres,
            gres_js,
            gres_ns,
            gres_needed,
            node_inx,
            SockTarget::Socket(s),
            link_state.as_mut(),
        );
    }
    if gres_needed > 0 {
        gres_needed -= pick_gres_topo(
            sock_gres,
            gres_js,
            gres_ns,
            gres_needed,
            node_inx,
            SockTarget::Any,
            link_state.as_mut(),
        );
    }

    // Finally the sockets the job did not allocate.
    for s in 0..sock_cnt {
        if gres_needed == 0 {
            break;
        }
        if used_sock.get(s).copied().unwrap_or(0) != 0 {
            continue;
        }
        gres_needed -= pick_gres_topo(
            sock_gres,
            gres_js,
            gres_ns,
            gres_needed,
            node_inx,
            SockTarget::Socket(s),
            link_state.as_mut(),
        );
    }
}

/// Per-socket selection. When the job's requested socket count differs
/// from the allocated one, rebuild the socket election from free-GRES
/// counts before picking.
pub(crate) fn set_sock_bits(
    sock_gres: &SockGres,
    gres_js: &mut GresJobState,
    gres_ns: &GresNodeState,
    node_inx: usize,
    job_id: JobId,
    mc: &McOptions,
    used_cores_on_sock: &[u32],
    used_sock_cnt: u32,
) {
    let sock_cnt = sock_gres.sock_cnt;
    let gres_cnt = gres_js.bit_select[node_inx]
        .as_ref()
        .map_or(0, |b| b.len());

    let mut used_sock_copy: Option<Vec<u32>> = None;
    if mc.sockets_per_node != 0
        && mc.sockets_per_node as u32 != used_sock_cnt
        && gres_ns.bit_alloc.is_some()
        && !sock_gres.bits_by_sock.is_empty()
    {
        let mut used_sock = used_cores_on_sock.to_vec();
        used_sock.resize(sock_cnt, 0);
        let mut used_sock_cnt = used_sock_cnt;
        let bit_alloc = gres_ns.bit_alloc.as_ref().unwrap();
        if mc.sockets_per_node as u32 > used_sock_cnt {
            // Somehow we have too few sockets in job allocation
            log::error!(
                "inconsistent requested/allocated socket count ({} > {}) for job {} on node {}",
                mc.sockets_per_node,
                used_sock_cnt,
                job_id,
                node_inx
            );
            for s in 0..sock_cnt {
                if used_sock[s] != 0 {
                    continue;
                }
                let Some(bits) = sock_gres.bits_by_sock.get(s).and_then(|b| b.as_ref()) else {
                    continue;
                };
                // Currently free GRES on this socket
                let free = (bits.count() - bits.overlap(bit_alloc)) as u32;
                used_sock[s] = free;
                if free == 0 || (free as u64) < gres_js.per_socket {
                    used_sock[s] = 0;
                } else {
                    used_sock_cnt += 1;
                    if used_sock_cnt == mc.sockets_per_node as u32 {
                        break;
                    }
                }
            }
        } else {
            // May have needed extra CPUs, exceeding socket count
            log::debug!(
                "inconsistent requested/allocated socket count ({} < {}) for job {} on node {}",
                mc.sockets_per_node,
                used_sock_cnt,
                job_id,
                node_inx
            );
            for s in 0..sock_cnt {
                if used_sock[s] == 0 {
                    continue;
                }
                let Some(bits) = sock_gres.bits_by_sock.get(s).and_then(|b| b.as_ref()) else {
                    continue;
                };
                let free = (bits.count() - bits.overlap(bit_alloc)) as u32;
                used_sock[s] = free;
                if free == 0 {
                    used_sock_cnt -= 1;
                }
            }
            // Exclude sockets with low GRES counts until parity
            while used_sock_cnt > mc.sockets_per_node as u32 {
                let mut low_sock_inx = None;
                for s in (0..sock_cnt).rev() {
                    if used_sock[s] == 0 {
                        continue;
                    }
                    if low_sock_inx.is_none_or(|low| used_sock[s] < used_sock[low]) {
                        low_sock_inx = Some(s);
                    }
                }
                let Some(low) = low_sock_inx else {
                    break;
                };
                used_sock[low] = 0;
                used_sock_cnt -= 1;
            }
        }
        used_sock_copy = Some(used_sock);
    }
    let used_sock: &[u32] = used_sock_copy.as_deref().unwrap_or(used_cores_on_sock);

    let mut link_state = LinkState::for_node(gres_ns, gres_cnt);

    for s in 0..sock_cnt {
        if used_sock.get(s).copied().unwrap_or(0) == 0 {
            continue;
        }
        let mut gres_needed = gres_js.per_socket;
        gres_needed -= pick_gres_topo(
            sock_gres,
            gres_js,
            gres_ns,
            gres_needed,
            node_inx,
            SockTarget::Socket(s),
            link_state.as_mut(),
        );
        if gres_needed > 0 {
            // Top up with units unconstrained by socket
            pick_gres_topo(
                sock_gres,
                gres_js,
                gres_ns,
                gres_needed,
                node_inx,
                SockTarget::Any,
                link_state.as_mut(),
            );
        }
    }
}

/// Per-task selection: each socket gets enough units for its tasks, then
/// the remainder comes from anywhere on the node.
pub(crate) fn set_task_bits(
    sock_gres: &SockGres,
    gres_js: &mut GresJobState,
    gres_ns: &GresNodeState,
    node_inx: usize,
    job_id: JobId,
    node_name: &str,
    tasks_per_socket: &[u32],
) {
    if tasks_per_socket.is_empty() {
        log::error!(
            "tasks_per_socket unset for job {} on node {}",
            job_id,
            node_name
        );
        return;
    }

    let sock_cnt = sock_gres.sock_cnt;
    let gres_cnt = gres_js.bit_select[node_inx]
        .as_ref()
        .map_or(0, |b| b.len());
    let mut link_state = LinkState::for_node(gres_ns, gres_cnt);

    let total_tasks = task_cnt_on_node(tasks_per_socket) as u64;
    let mut gres_needed = total_tasks * gres_js.per_task;

    for s in 0..sock_cnt {
        let tasks = tasks_per_socket.get(s).copied().unwrap_or(0) as u64;
        if tasks == 0 {
            continue;
        }
        let sock_gres_needed = gres_needed.min(tasks * gres_js.per_task);
        gres_needed -= pick_gres_topo(
            sock_gres,
            gres_js,
            gres_ns,
            sock_gres_needed,
            node_inx,
            SockTarget::Socket(s),
            link_state.as_mut(),
        );
    }
    if gres_needed > 0 {
        gres_needed -= pick_gres_topo(
            sock_gres,
            gres_js,
            gres_ns,
            gres_needed,
            node_inx,
            SockTarget::Any,
            link_state.as_mut(),
        );
    }

    for s in 0..sock_cnt {
        if gres_needed == 0 {
            break;
        }
        gres_needed -= pick_gres_topo(
            sock_gres,
            gres_js,
            gres_ns,
            gres_needed,
            node_inx,
            SockTarget::Socket(s),
            link_state.as_mut(),
        );
    }

    if gres_needed > 0 {
        // Something bad happened on task layout for this GRES kind
        log::error!(
            "insufficient gres/{} allocated for job {} on node {} (still needed {}, total requested {})",
            gres_js.name,
            job_id,
            node_inx,
            gres_needed,
            total_tasks * gres_js.per_task
        );
    }
}

/// Per-job selection, first pass: reserve enough on this node while
/// leaving at least one unit's worth of headroom per remaining node.
/// Returns whether the job-wide counter is met.
pub(crate) fn set_job_bits1(
    sock_gres: &SockGres,
    gres_js: &mut GresJobState,
    gres_ns: &GresNodeState,
    node_inx: usize,
    job_node_inx: usize,
    rem_nodes: usize,
    job_id: JobId,
    mc: &McOptions,
    cpus_per_core: u16,
    cores_on_sock: &[u32],
    total_cores: u32,
) -> i32 {
    let mut fini = 0;
    if gres_js.per_job == gres_js.total_gres {
        fini = 1;
    }
    let sock_cnt = sock_gres.sock_cnt;
    if job_node_inx == 0 {
        gres_js.total_gres = 0;
    }
    let mut max_gres =
        gres_js.per_job as i64 - gres_js.total_gres as i64 - (rem_nodes as i64 - 1);
    let gres_cnt = gres_js.bit_select[node_inx]
        .as_ref()
        .map_or(0, |b| b.len());
    let cpus_per_gres: u16 = if gres_js.cpus_per_gres != 0 {
        gres_js.cpus_per_gres
    } else if let Some(ntasks) = gres_js.ntasks_per_gres.filter(|&n| n > 0) {
        ntasks.saturating_mul(mc.cpus_per_task)
    } else {
        0
    };
    if cpus_per_gres != 0 {
        max_gres = max_gres.min(total_cores as i64 * cpus_per_core as i64 / cpus_per_gres as i64);
    }
    let pick_gres: u64 = if max_gres > 1 && gres_ns.links_usable(gres_cnt) {
        // Select everything that fits, then prune to the best-linked set
        u64::MAX
    } else {
        // max_gres can be < 1 when per_job is smaller than the remaining
        // node count; still place at least one unit on every node.
        max_gres.max(1) as u64
    };

    let mut alloc_gres_cnt: u64 = 0;
    for s in 0..sock_cnt {
        if alloc_gres_cnt >= pick_gres {
            break;
        }
        if cores_on_sock.get(s).copied().unwrap_or(0) == 0 {
            continue;
        }
        alloc_gres_cnt += pick_gres_topo(
            sock_gres,
            gres_js,
            gres_ns,
            pick_gres - alloc_gres_cnt,
            node_inx,
            SockTarget::Socket(s),
            None,
        );
    }
    if alloc_gres_cnt < pick_gres {
        alloc_gres_cnt += pick_gres_topo(
            sock_gres,
            gres_js,
            gres_ns,
            pick_gres - alloc_gres_cnt,
            node_inx,
            SockTarget::Any,
            None,
        );
    }
    if alloc_gres_cnt == 0 {
        for s in 0..sock_cnt {
            if alloc_gres_cnt > 0 {
                break;
            }
            if cores_on_sock.get(s).copied().unwrap_or(0) != 0 {
                continue;
            }
            alloc_gres_cnt += pick_gres_topo(
                sock_gres,
                gres_js,
                gres_ns,
                1,
                node_inx,
                SockTarget::Socket(s),
                None,
            );
        }
    }
    if alloc_gres_cnt == 0 {
        log::error!(
            "job {} failed to find any available gres/{} on node {}",
            job_id,
            gres_js.name,
            node_inx
        );
    }

    // Keep the max_gres units with the best link counts, dropping the rest.
    if alloc_gres_cnt as i64 > max_gres {
        let mut best_link_cnt: i64 = -1;
        let mut best_inx = None;
        {
            let bit_select = gres_js.bit_select[node_inx].as_ref().unwrap();
            for s in 0..gres_cnt {
                if !bit_select.test(s) {
                    continue;
                }
                for g in s + 1..gres_cnt {
                    if !bit_select.test(g) {
                        continue;
                    }
                    if gres_ns.link(s, g) <= best_link_cnt {
                        continue;
                    }
                    best_link_cnt = gres_ns.link(s, g);
                    best_inx = Some(s);
                }
            }
        }
        while alloc_gres_cnt as i64 > max_gres && best_link_cnt != -1 {
            let best = best_inx.unwrap();
            let mut worst_inx = None;
            let mut worst_link_cnt = i64::MAX;
            {
                let bit_select = gres_js.bit_select[node_inx].as_ref().unwrap();
                for g in 0..gres_cnt {
                    if g == best || !bit_select.test(g) {
                        continue;
                    }
                    if gres_ns.link(best, g) >= worst_link_cnt {
                        continue;
                    }
                    worst_link_cnt = gres_ns.link(best, g);
                    worst_inx = Some(g);
                }
            }
            let Some(worst) = worst_inx else {
                log::error!("job {} error managing link counts", job_id);
                break;
            };
            gres_js.bit_select[node_inx].as_mut().unwrap().clear(worst);
            gres_js.cnt_node_select[node_inx] -= 1;
            alloc_gres_cnt -= 1;
        }
    }
    gres_js.total_gres += alloc_gres_cnt;

    if gres_js.total_gres >= gres_js.per_job {
        fini = 1;
    }
    fini
}

/// Per-job selection, second pass: take any remaining free units on the
/// node, preferring those best linked to the units already chosen.
/// Returns whether the job-wide counter is met.
pub(crate) fn set_job_bits2(
    sock_gres: &SockGres,
    gres_js: &mut GresJobState,
    gres_ns: &GresNodeState,
    node_inx: usize,
    job_id: JobId,
) -> bool {
    if gres_js.per_job <= gres_js.total_gres {
        return true;
    }
    let Some(gres_cnt) = gres_js
        .bit_select
        .get(node_inx)
        .and_then(|b| b.as_ref())
        .map(|b| b.len())
    else {
        log::error!(
            "gres/{} selection bitmap missing for job {} on node {}",
            gres_js.name,
            job_id,
            node_inx
        );
        return true;
    };

    let mut link_state = if gres_ns.links_usable(gres_cnt) {
        let chosen: Vec<usize> = gres_js.bit_select[node_inx]
            .as_ref()
            .unwrap()
            .iter_set()
            .collect();
        Some(LinkState::seeded(gres_ns, chosen.into_iter(), gres_cnt))
    } else {
        None
    };

    for s in 0..sock_gres.sock_cnt {
        if gres_js.per_job <= gres_js.total_gres {
            break;
        }
        let needed = gres_js.per_job - gres_js.total_gres;
        let picked = pick_gres_topo(
            sock_gres,
            gres_js,
            gres_ns,
            needed,
            node_inx,
            SockTarget::Socket(s),
            link_state.as_mut(),
        );
        gres_js.total_gres += picked;
    }
    if gres_js.per_job > gres_js.total_gres {
        let needed = gres_js.per_job - gres_js.total_gres;
        let picked = pick_gres_topo(
            sock_gres,
            gres_js,
            gres_ns,
            needed,
            node_inx,
            SockTarget::Any,
            link_state.as_mut(),
        );
        gres_js.total_gres += picked;
    }

    gres_js.per_job <= gres_js.total_gres
}
