use log::debug;
use rand::Rng;
use shared::{PartitionId, Rect, SubjectId, SubjectState, SUBJECT_SPEED};
use std::collections::{HashMap, HashSet};

/// Chance per step that a subject picks a new heading.
const TURN_PROBABILITY: f64 = 0.02;

/// Subjects simulated by this host plus the latest world snapshot seen for
/// each partition.
#[derive(Debug, Clone)]
pub struct LocalWorld {
    pub tick: u32,
    bounds: Rect,
    subjects: HashMap<SubjectId, SubjectState>,
    restored: HashSet<SubjectId>,
    observed: HashMap<PartitionId, (u32, Vec<SubjectState>)>,
}

impl LocalWorld {
    pub fn new(bounds: Rect) -> Self {
        Self {
            tick: 0,
            bounds,
            subjects: HashMap::new(),
            restored: HashSet::new(),
            observed: HashMap::new(),
        }
    }

    pub fn set_bounds(&mut self, bounds: Rect) {
        self.bounds = bounds;
    }

    /// Adds a subject at a random position with a random heading.
    pub fn spawn<R: Rng>(&mut self, id: SubjectId, rng: &mut R) {
        let x = rng.gen_range(self.bounds.x..self.bounds.max_x());
        let y = rng.gen_range(self.bounds.y..self.bounds.max_y());
        let mut state = SubjectState::new(id, x, y);
        Self::turn(&mut state, rng);
        self.subjects.insert(id, state);
    }

    pub fn insert(&mut self, state: SubjectState) {
        self.subjects.insert(state.id, state);
    }

    pub fn subject(&self, id: SubjectId) -> Option<&SubjectState> {
        self.subjects.get(&id)
    }

    pub fn subject_ids(&self) -> Vec<SubjectId> {
        let mut ids: Vec<SubjectId> = self.subjects.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Replaces a subject's local state with its last committed state the
    /// first time one is supplied. Returns true if it was applied.
    pub fn restore(&mut self, state: SubjectState) -> bool {
        if !self.subjects.contains_key(&state.id) || !self.restored.insert(state.id) {
            return false;
        }
        debug!("Restored {} at ({:.1}, {:.1})", state.id, state.x, state.y);
        self.subjects.insert(state.id, state);
        true
    }

    pub fn step<R: Rng>(&mut self, dt: f32, rng: &mut R) {
        for state in self.subjects.values_mut() {
            if rng.gen_bool(TURN_PROBABILITY) {
                Self::turn(state, rng);
            }

            state.x += state.vel_x * dt;
            state.y += state.vel_y * dt;

            if state.x < self.bounds.x || state.x >= self.bounds.max_x() {
                state.vel_x = -state.vel_x;
            }
            if state.y < self.bounds.y || state.y >= self.bounds.max_y() {
                state.vel_y = -state.vel_y;
            }
            let (x, y) = self.bounds.clamp_point(state.x, state.y);
            state.x = x;
            state.y = y;
        }
        self.tick += 1;
    }

    fn turn<R: Rng>(state: &mut SubjectState, rng: &mut R) {
        let heading = rng.gen_range(0.0..std::f32::consts::TAU);
        state.vel_x = heading.cos() * SUBJECT_SPEED;
        state.vel_y = heading.sin() * SUBJECT_SPEED;
    }

    /// Keeps a world snapshot unless a newer one was already seen.
    pub fn observe(&mut self, partition: PartitionId, tick: u32, subjects: Vec<SubjectState>) {
        match self.observed.get(&partition) {
            Some((seen, _)) if *seen >= tick => {}
            _ => {
                self.observed.insert(partition, (tick, subjects));
            }
        }
    }

    pub fn observed(&self, partition: PartitionId) -> Option<&[SubjectState]> {
        self.observed.get(&partition).map(|(_, s)| s.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn world() -> LocalWorld {
        LocalWorld::new(Rect::new(0.0, 0.0, 800.0, 600.0))
    }

    #[test]
    fn test_spawn_inside_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut world = world();
        for i in 0..50 {
            world.spawn(SubjectId(i), &mut rng);
        }

        assert_eq!(world.len(), 50);
        for id in world.subject_ids() {
            let s = world.subject(id).unwrap();
            assert!(s.x >= 0.0 && s.x < 800.0);
            assert!(s.y >= 0.0 && s.y < 600.0);
            let speed = (s.vel_x * s.vel_x + s.vel_y * s.vel_y).sqrt();
            assert_approx_eq!(speed, SUBJECT_SPEED, 0.01);
        }
    }

    #[test]
    fn test_step_keeps_subjects_in_world() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut world = world();
        let mut runaway = SubjectState::new(SubjectId(1), 799.0, 10.0);
        runaway.vel_x = 500.0;
        runaway.vel_y = -500.0;
        world.insert(runaway);

        for _ in 0..100 {
            world.step(1.0 / 20.0, &mut rng);
            let s = world.subject(SubjectId(1)).unwrap();
            assert!(s.x >= 0.0 && s.x < 800.0);
            assert!(s.y >= 0.0 && s.y < 600.0);
        }
        assert_eq!(world.tick, 100);
    }

    #[test]
    fn test_restore_applies_once() {
        let mut world = world();
        world.insert(SubjectState::new(SubjectId(1), 10.0, 10.0));

        assert!(world.restore(SubjectState::new(SubjectId(1), 300.0, 200.0)));
        assert!(!world.restore(SubjectState::new(SubjectId(1), 5.0, 5.0)));
        assert_approx_eq!(world.subject(SubjectId(1)).unwrap().x, 300.0);
        assert!(!world.restore(SubjectState::new(SubjectId(2), 5.0, 5.0)));
    }

    #[test]
    fn test_observe_ignores_older_snapshots() {
        let mut world = world();
        let a = vec![SubjectState::new(SubjectId(1), 1.0, 1.0)];
        world.observe(PartitionId(3), 5, a.clone());
        world.observe(PartitionId(3), 4, Vec::new());
        assert_eq!(world.observed(PartitionId(3)).unwrap(), a.as_slice());
    }
}
