// src/dag/cartesian.rs

//! Cartesian product over an operator's per-slot candidate lists.

use std::collections::BTreeMap;

use crate::types::{DataUnitId, SlotName};

/// Candidate data units for each input slot, in slot order.
pub type SlotOptions = Vec<(SlotName, Vec<DataUnitId>)>;

/// Number of bindings [`cartesian_product`] would yield, or `None` if it does
/// not fit in a `usize`.
pub fn product_size(options: &SlotOptions) -> Option<usize> {
    options
        .iter()
        .try_fold(1usize, |acc, (_, units)| acc.checked_mul(units.len()))
}

/// Every slot -> unit binding that picks one candidate per slot.
///
/// Iteration is lexicographic: the last slot varies fastest, and each slot's
/// candidates are taken in the order given. An empty option list yields a
/// single empty binding; any slot without candidates yields nothing.
pub fn cartesian_product(options: &SlotOptions) -> Vec<BTreeMap<SlotName, DataUnitId>> {
    let mut bindings: Vec<Vec<&DataUnitId>> = vec![Vec::new()];

    for (_, units) in options {
        let mut next = Vec::with_capacity(bindings.len() * units.len());
        for prefix in &bindings {
            for unit in units {
                let mut extended = prefix.clone();
                extended.push(unit);
                next.push(extended);
            }
        }
        bindings = next;
    }

    bindings
        .into_iter()
        .map(|picked| {
            options
                .iter()
                .map(|(slot, _)| slot.clone())
                .zip(picked.into_iter().cloned())
                .collect()
        })
        .collect()
}
