use std::{cmp::Ordering, fmt};

/// Number of components in a vector clock, one per assignable address.
pub const NODE_SLOTS: usize = 255;

/// A fixed-length vector clock with one counter per node address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VectorTime {
    clocks: Vec<u64>,
}

impl Default for VectorTime {
    fn default() -> Self {
        Self::new(NODE_SLOTS)
    }
}

impl VectorTime {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            clocks: vec![0; len],
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    /// Returns the counter for `index`, or `0` for an index past the end.
    #[must_use]
    pub fn get(&self, index: usize) -> u64 {
        self.clocks.get(index).copied().unwrap_or(0)
    }

    /// Advances the component owned by `index`.
    ///
    /// # Panics
    ///
    /// * If `index` is outside the vector
    pub fn step(&mut self, index: usize) {
        self.clocks[index] += 1;
    }

    /// Takes the pointwise maximum of `self` and `other`.
    ///
    /// # Panics
    ///
    /// * If the two vectors have different lengths
    pub fn update_to(&mut self, other: &Self) {
        assert_eq!(
            self.len(),
            other.len(),
            "cannot merge vector clocks of different lengths"
        );
        for (mine, theirs) in self.clocks.iter_mut().zip(&other.clocks) {
            *mine = (*mine).max(*theirs);
        }
    }

    /// Strict happened-before: every component is `<=` and at least one is `<`.
    #[must_use]
    pub fn less_than(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }

        let mut strictly = false;
        for (mine, theirs) in self.clocks.iter().zip(&other.clocks) {
            if mine > theirs {
                return false;
            }
            strictly |= mine < theirs;
        }
        strictly
    }
}

impl PartialOrd for VectorTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            Some(Ordering::Equal)
        } else if self.less_than(other) {
            Some(Ordering::Less)
        } else if other.less_than(self) {
            Some(Ordering::Greater)
        } else {
            None
        }
    }
}

impl fmt::Display for VectorTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, clock) in self.clocks.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{clock}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn vt(clocks: &[u64]) -> VectorTime {
        VectorTime {
            clocks: clocks.to_vec(),
        }
    }

    #[test_log::test]
    fn default_has_one_slot_per_address() {
        let time = VectorTime::default();

        assert_eq!(time.len(), NODE_SLOTS);
        assert!((0..NODE_SLOTS).all(|i| time.get(i) == 0));
    }

    #[test_log::test]
    fn step_only_touches_own_component() {
        let mut time = VectorTime::new(3);
        time.step(1);
        time.step(1);

        assert_eq!(time, vt(&[0, 2, 0]));
    }

    #[test_log::test]
    fn update_to_takes_pointwise_max() {
        let mut time = vt(&[3, 0, 5]);
        time.update_to(&vt(&[1, 4, 5]));

        assert_eq!(time, vt(&[3, 4, 5]));
    }

    #[test_log::test]
    fn update_then_step_never_decreases_a_component() {
        let samples = [
            vt(&[0, 0, 0]),
            vt(&[2, 1, 0]),
            vt(&[0, 7, 1]),
            vt(&[4, 4, 4]),
        ];

        for before in &samples {
            for other in &samples {
                for owner in 0..3 {
                    let mut after = before.clone();
                    after.update_to(other);
                    after.step(owner);

                    for i in 0..3 {
                        assert!(after.get(i) >= before.get(i));
                        assert!(after.get(i) >= other.get(i));
                    }
                    assert!(before.less_than(&after));
                }
            }
        }
    }

    #[test_log::test]
    fn less_than_is_irreflexive() {
        for time in [vt(&[0, 0]), vt(&[1, 0]), vt(&[3, 9])] {
            assert!(!time.less_than(&time));
        }
    }

    #[test_log::test]
    fn less_than_is_transitive() {
        let samples = [
            vt(&[0, 0, 0]),
            vt(&[1, 0, 0]),
            vt(&[1, 1, 0]),
            vt(&[0, 1, 0]),
            vt(&[2, 1, 3]),
            vt(&[2, 2, 3]),
        ];

        for a in &samples {
            for b in &samples {
                for c in &samples {
                    if a.less_than(b) && b.less_than(c) {
                        assert!(a.less_than(c), "{a} < {b} < {c}");
                    }
                }
            }
        }
    }

    #[test_log::test]
    fn concurrent_clocks_are_unordered() {
        let a = vt(&[1, 0]);
        let b = vt(&[0, 1]);

        assert!(!a.less_than(&b));
        assert!(!b.less_than(&a));
        assert_eq!(a.partial_cmp(&b), None);
        assert_eq!(a.partial_cmp(&vt(&[1, 1])), Some(Ordering::Less));
    }

    #[test_log::test]
    fn display_is_comma_separated() {
        assert_eq!(vt(&[1, 0, 12]).to_string(), "1,0,12");
    }
}
