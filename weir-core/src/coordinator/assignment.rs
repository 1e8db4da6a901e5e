//! Sticky, deterministic partition balancing. Partitions already owned by a live
//! worker stay put unless moving one is required to keep the per-worker load within
//! one partition of the minimum; unowned partitions go to the least-loaded workers.
//! All ties break on worker id and partition id so every coordinator computes the
//! same plan from the same inputs.

use std::collections::HashMap;

pub(crate) fn rebalance(
    partitions: &[u16],
    workers: &[String],
    previous: &HashMap<u16, String>,
) -> HashMap<u16, String> {
    if workers.is_empty() {
        return HashMap::new();
    }

    let mut sorted_workers: Vec<&str> = workers.iter().map(String::as_str).collect();
    sorted_workers.sort_unstable();
    let mut sorted_partitions = partitions.to_vec();
    sorted_partitions.sort_unstable();

    let mut next: HashMap<u16, String> = HashMap::new();
    let mut load: HashMap<&str, usize> = sorted_workers.iter().map(|w| (*w, 0)).collect();

    // keep live owners (stickiness)
    let mut unassigned = Vec::new();
    for &partition in &sorted_partitions {
        match previous.get(&partition) {
            Some(owner) if load.contains_key(owner.as_str()) => {
                *load.get_mut(owner.as_str()).expect("owner is live") += 1;
                next.insert(partition, owner.clone());
            }
            _ => unassigned.push(partition),
        }
    }

    // hand newly available partitions to the least-loaded workers
    for partition in unassigned {
        let target = *sorted_workers
            .iter()
            .min_by_key(|w| (load[**w], **w))
            .expect("workers is non-empty");
        *load.get_mut(target).expect("target is live") += 1;
        next.insert(partition, target.to_string());
    }

    // move partitions off overloaded workers until the spread is at most one
    loop {
        let busiest = *sorted_workers
            .iter()
            .max_by_key(|w| (load[**w], std::cmp::Reverse(**w)))
            .expect("workers is non-empty");
        let idlest = *sorted_workers
            .iter()
            .min_by_key(|w| (load[**w], **w))
            .expect("workers is non-empty");
        if load[busiest] - load[idlest] <= 1 {
            break;
        }

        let moved = next
            .iter()
            .filter(|(_, owner)| owner.as_str() == busiest)
            .map(|(partition, _)| *partition)
            .max()
            .expect("busiest worker owns at least one partition");
        next.insert(moved, idlest.to_string());
        *load.get_mut(busiest).expect("busiest is live") -= 1;
        *load.get_mut(idlest).expect("idlest is live") += 1;
    }

    next
}
