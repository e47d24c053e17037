//! Sweep-group scheduling.
//!
//! Zones cannot be swept in arbitrary order: a zone holding a live edge
//! into another zone must not watch its referent get finalized first. The
//! cross-zone edges (gathered from compartment wrapper maps) form a
//! directed graph; its strongly connected components must be swept
//! atomically, and components are processed targets-first so that by the
//! time a zone sweeps, everything it points into has already been swept or
//! is being swept with it (P4).

use hashbrown::HashMap;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use super::region::zone_of;
use super::zone::Zone;

/// Compute sweep groups for the collecting zones, in sweep order. Also
/// threads each group through the zones' `next_in_sweep_group` links.
pub unsafe fn find_sweep_groups(collecting: &[*mut Zone]) -> Vec<Vec<*mut Zone>> {
    let mut graph: DiGraph<*mut Zone, ()> = DiGraph::new();
    let mut nodes: HashMap<usize, NodeIndex> = HashMap::new();

    for &zone in collecting {
        let index = graph.add_node(zone);
        nodes.insert(zone as usize, index);
    }

    for &zone in collecting {
        let from = nodes[&(zone as usize)];
        for compartment in (*zone).compartments.iter() {
            for (&target, _wrapper) in compartment.wrappers.iter() {
                let target_zone = zone_of(target as *mut super::cell::CellHeader);
                if target_zone.is_null() || target_zone == zone {
                    continue;
                }
                if let Some(&to) = nodes.get(&(target_zone as usize)) {
                    graph.update_edge(from, to, ());
                }
            }
        }
    }

    // Tarjan emits SCCs in reverse topological order: for an edge A→B the
    // component of B comes first. That is exactly sweep order — referents
    // before referrers.
    let components = tarjan_scc(&graph);

    let mut groups = Vec::with_capacity(components.len());
    for component in components {
        let mut zones: Vec<*mut Zone> = component.iter().map(|&ix| graph[ix]).collect();
        for window in 0..zones.len() {
            let next = if window + 1 < zones.len() {
                zones[window + 1]
            } else {
                std::ptr::null_mut()
            };
            (*zones[window]).next_in_sweep_group = next;
        }
        groups.push(zones);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::runtime::{GcRuntime, InitialHeap};
    use crate::gc::zone::{ZoneGcState, ZoneSpec};
    use crate::GcParams;

    fn make_zone() -> Box<Zone> {
        let mut zone = Zone::new(std::ptr::null_mut(), std::ptr::null_mut(), 0, false);
        zone.state = ZoneGcState::MarkBlack;
        zone
    }

    #[test]
    fn independent_zones_form_singleton_groups() {
        let mut a = make_zone();
        let mut b = make_zone();
        let zones = vec![&mut *a as *mut Zone, &mut *b as *mut Zone];
        let groups = unsafe { find_sweep_groups(&zones) };
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.len() == 1));
    }

    #[test]
    fn group_links_are_threaded() {
        let mut a = make_zone();
        let zones = vec![&mut *a as *mut Zone];
        let groups = unsafe { find_sweep_groups(&zones) };
        assert_eq!(groups.len(), 1);
        assert!(a.next_in_sweep_group.is_null());
    }

    /// P4 structure: a one-way edge sweeps the referent's zone first; a
    /// cycle collapses both zones into one group.
    #[test]
    fn edges_order_groups_and_cycles_merge_them() {
        let mut rt = GcRuntime::new(GcParams::default());
        let comp_a = rt.new_compartment(ZoneSpec::NewZoneInNewGroup).unwrap();
        let comp_b = rt.new_compartment(ZoneSpec::NewZoneInNewGroup).unwrap();
        let zone_a = unsafe { (*comp_a).zone() };
        let zone_b = unsafe { (*comp_b).zone() };

        let target_in_b = rt
            .allocate_object(comp_b, 0, true, InitialHeap::Tenured)
            .unwrap();
        rt.new_wrapper(comp_a, target_in_b.as_cell()).unwrap();

        unsafe {
            // One-way A→B: B's group must come first.
            (*zone_a).state = ZoneGcState::MarkBlack;
            (*zone_b).state = ZoneGcState::MarkBlack;
            let groups = find_sweep_groups(&[zone_a, zone_b]);
            assert_eq!(groups.len(), 2);
            assert_eq!(groups[0], vec![zone_b]);
            assert_eq!(groups[1], vec![zone_a]);
            (*zone_a).state = ZoneGcState::NoGc;
            (*zone_b).state = ZoneGcState::NoGc;

            // Close the cycle B→A: one group holding both.
            let target_in_a = rt
                .allocate_object(comp_a, 0, true, InitialHeap::Tenured)
                .unwrap();
            rt.new_wrapper(comp_b, target_in_a.as_cell()).unwrap();
            (*zone_a).state = ZoneGcState::MarkBlack;
            (*zone_b).state = ZoneGcState::MarkBlack;
            let groups = find_sweep_groups(&[zone_a, zone_b]);
            assert_eq!(groups.len(), 1);
            assert_eq!(groups[0].len(), 2);
            // The group is threaded through the zones' links.
            let first = groups[0][0];
            assert_eq!((*first).next_in_sweep_group, groups[0][1]);
            (*zone_a).state = ZoneGcState::NoGc;
            (*zone_b).state = ZoneGcState::NoGc;
        }
    }
}
