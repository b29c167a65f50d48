//! Keyed collection of dose-volume constraints

use crate::constraint::{Constraint, Threshold};
use crate::export::ConstraintMarker;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Identifier assigned to a constraint when it joins a [`ConstraintList`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConstraintId(Uuid);

impl ConstraintId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ConstraintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Constraints for one structure, keyed by generated id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConstraintList {
    items: HashMap<ConstraintId, Constraint>,
    last_id: Option<ConstraintId>,
}

impl ConstraintList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constraint and return its new id
    pub fn add(&mut self, constraint: Constraint) -> ConstraintId {
        let mut id = ConstraintId::generate();
        while self.items.contains_key(&id) {
            id = ConstraintId::generate();
        }
        self.items.insert(id, constraint);
        self.last_id = Some(id);
        id
    }

    /// Copy every constraint of `other` into this list under fresh ids
    pub fn merge(&mut self, other: &ConstraintList) {
        for constraint in other.items.values() {
            self.add(constraint.clone());
        }
    }

    pub fn remove(&mut self, id: &ConstraintId) -> Option<Constraint> {
        let removed = self.items.remove(id);
        if removed.is_some() && self.last_id.as_ref() == Some(id) {
            self.last_id = None;
        }
        removed
    }

    /// Remove the first constraint equal to `constraint`
    pub fn remove_matching(&mut self, constraint: &Constraint) -> Option<(ConstraintId, Constraint)> {
        let id = self
            .items
            .iter()
            .find(|(_, c)| *c == constraint)
            .map(|(id, _)| *id)?;
        self.remove(&id).map(|c| (id, c))
    }

    pub fn get(&self, id: &ConstraintId) -> Option<&Constraint> {
        self.items.get(id)
    }

    pub fn get_mut(&mut self, id: &ConstraintId) -> Option<&mut Constraint> {
        self.items.get_mut(id)
    }

    /// Id of the most recently added constraint still in the list
    pub fn last_id(&self) -> Option<ConstraintId> {
        self.last_id
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ConstraintId, &Constraint)> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True when every constraint bounds the mean dose (vacuously true when empty)
    pub fn mean_only(&self) -> bool {
        self.items
            .values()
            .all(|c| c.threshold() == Threshold::Mean)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.last_id = None;
    }

    /// Plot markers for every constraint, keyed by id
    pub fn plotting_data(&self) -> Vec<(ConstraintId, ConstraintMarker)> {
        self.items
            .iter()
            .map(|(id, c)| (*id, ConstraintMarker::from(c)))
            .collect()
    }
}

impl fmt::Display for ConstraintList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "(keys):\t (constraints)")?;
        for (id, constraint) in &self.items {
            writeln!(f, "{}:\t{}", id, constraint)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a ConstraintList {
    type Item = (&'a ConstraintId, &'a Constraint);
    type IntoIter = std::collections::hash_map::Iter<'a, ConstraintId, Constraint>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d90() -> Constraint {
        Constraint::at_percentile(90.0).unwrap().with_upper_bound(50.0).unwrap()
    }

    #[test]
    fn test_add_assigns_unique_ids() {
        let mut list = ConstraintList::new();
        let a = list.add(d90());
        let b = list.add(d90());
        assert_ne!(a, b);
        assert_eq!(list.len(), 2);
        assert_eq!(list.last_id(), Some(b));
        assert_eq!(a.to_string().len(), 32);
    }

    #[test]
    fn test_merge_rekeys() {
        let mut first = ConstraintList::new();
        first.add(d90());
        let mut second = ConstraintList::new();
        let kept = second.add(Constraint::mean().with_upper_bound(20.0).unwrap());
        second.add(Constraint::max().with_upper_bound(70.0).unwrap());

        first.merge(&second);
        assert_eq!(first.len(), 3);
        assert!(first.get(&kept).is_none());
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn test_remove_by_id_and_identity() {
        let mut list = ConstraintList::new();
        let id = list.add(d90());
        let mean = Constraint::mean().with_lower_bound(10.0).unwrap();
        list.add(mean.clone());

        assert!(list.remove(&id).is_some());
        assert!(list.remove(&id).is_none());

        let (_, removed) = list.remove_matching(&mean).unwrap();
        assert_eq!(removed, mean);
        assert!(list.is_empty());
        assert!(list.remove_matching(&mean).is_none());
    }

    #[test]
    fn test_mean_only() {
        let mut list = ConstraintList::new();
        assert!(list.mean_only());
        list.add(Constraint::mean().with_upper_bound(20.0).unwrap());
        assert!(list.mean_only());
        list.add(d90());
        assert!(!list.mean_only());
        list.clear();
        assert!(list.mean_only());
        assert_eq!(list.last_id(), None);
    }

    #[test]
    fn test_display_lists_each_constraint() {
        let mut list = ConstraintList::new();
        let id = list.add(d90());
        let rendered = list.to_string();
        assert!(rendered.starts_with("(keys):"));
        assert!(rendered.contains(&format!("{}:\tD90 <= 50Gy", id)));
    }
}
