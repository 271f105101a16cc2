//! Partitioning of constraints into independent work units.
//!
//! Two flavours are built from the connected groups of coupled constraints:
//!
//! * [`ConstraintTask`]s for multi-threaded CPU solving. Tasks own disjoint
//!   atom sets, gather their atoms into local buffers, solve, and scatter the
//!   results back once all tasks are done.
//! * [`BlockLayout`] for the block kernel. Groups are packed into fixed-size
//!   blocks so that no coupling crosses a block boundary; the unused slots at
//!   the end of a block are dummies.

use crate::error::{ConstraintError, Result};
use crate::topology::ConstraintTopology;
use rayon::prelude::*;

/// Split coupled groups into `num_tasks` sets with balanced constraint
/// counts (largest group first onto the least loaded task).
pub fn balance_groups(groups: &[Vec<usize>], num_tasks: usize) -> Vec<Vec<usize>> {
    let num_tasks = num_tasks.max(1).min(groups.len().max(1));
    let mut order: Vec<usize> = (0..groups.len()).collect();
    order.sort_by(|&a, &b| groups[b].len().cmp(&groups[a].len()).then(a.cmp(&b)));

    let mut tasks: Vec<Vec<usize>> = vec![Vec::new(); num_tasks];
    let mut loads = vec![0usize; num_tasks];
    for g in order {
        let (target, _) = loads
            .iter()
            .enumerate()
            .min_by_key(|&(t, &load)| (load, t))
            .unwrap_or((0, &0));
        tasks[target].extend_from_slice(&groups[g]);
        loads[target] += groups[g].len();
    }
    for t in &mut tasks {
        t.sort_unstable();
    }
    tasks.retain(|t| !t.is_empty());
    tasks
}

/// A set of constraints solved independently of all other tasks, together
/// with local copies of the atom data it touches.
#[derive(Debug, Clone)]
pub struct ConstraintTask {
    /// Global indices of the constraints in this task, ascending.
    constraints: Vec<usize>,
    /// Global indices of the atoms in this task, ascending.
    atoms: Vec<usize>,
    topology: ConstraintTopology,
    inverse_masses: Vec<f64>,
    x: Vec<[f64; 3]>,
    xprime: Vec<[f64; 3]>,
    v: Vec<[f64; 3]>,
}

/// Borrowed views of a task's local buffers for one solve.
pub struct TaskBuffers<'a> {
    /// Global constraint index of each local constraint.
    pub constraints: &'a [usize],
    pub topology: &'a ConstraintTopology,
    pub inverse_masses: &'a [f64],
    pub x: &'a [[f64; 3]],
    pub xprime: &'a mut [[f64; 3]],
    pub v: Option<&'a mut [[f64; 3]]>,
}

impl ConstraintTask {
    pub fn new(
        global: &ConstraintTopology,
        inverse_masses: &[f64],
        constraints: Vec<usize>,
    ) -> Result<Self> {
        let mut atoms: Vec<usize> = constraints
            .iter()
            .flat_map(|&c| {
                let p = global.pair(c);
                [p.i, p.j]
            })
            .collect();
        atoms.sort_unstable();
        atoms.dedup();
        let topology = global.extract(&atoms, &constraints)?;
        let local_inverse_masses = atoms.iter().map(|&a| inverse_masses[a]).collect();
        Ok(Self {
            constraints,
            topology,
            inverse_masses: local_inverse_masses,
            x: vec![[0.0; 3]; atoms.len()],
            xprime: vec![[0.0; 3]; atoms.len()],
            v: Vec::new(),
            atoms,
        })
    }

    pub fn constraints(&self) -> &[usize] {
        &self.constraints
    }

    pub fn atoms(&self) -> &[usize] {
        &self.atoms
    }

    pub fn topology(&self) -> &ConstraintTopology {
        &self.topology
    }

    pub fn inverse_masses(&self) -> &[f64] {
        &self.inverse_masses
    }

    /// Copy the task's atoms from the global arrays.
    pub fn gather(&mut self, x: &[[f64; 3]], xprime: &[[f64; 3]], v: Option<&[[f64; 3]]>) {
        for (local, &global) in self.atoms.iter().enumerate() {
            self.x[local] = x[global];
            self.xprime[local] = xprime[global];
        }
        match v {
            Some(v) => {
                self.v.resize(self.atoms.len(), [0.0; 3]);
                for (local, &global) in self.atoms.iter().enumerate() {
                    self.v[local] = v[global];
                }
            }
            None => self.v.clear(),
        }
    }

    /// Write the task's constrained positions (and velocities) back.
    pub fn scatter(&self, xprime: &mut [[f64; 3]], v: Option<&mut [[f64; 3]]>) {
        for (local, &global) in self.atoms.iter().enumerate() {
            xprime[global] = self.xprime[local];
        }
        if let Some(v) = v {
            if self.v.len() == self.atoms.len() {
                for (local, &global) in self.atoms.iter().enumerate() {
                    v[global] = self.v[local];
                }
            }
        }
    }

    pub fn buffers(&mut self) -> TaskBuffers<'_> {
        let v = if self.v.is_empty() {
            None
        } else {
            Some(self.v.as_mut_slice())
        };
        TaskBuffers {
            constraints: &self.constraints,
            topology: &self.topology,
            inverse_masses: &self.inverse_masses,
            x: &self.x,
            xprime: &mut self.xprime,
            v,
        }
    }
}

/// Build one task per balanced set of coupled groups.
pub fn build_tasks(
    topology: &ConstraintTopology,
    inverse_masses: &[f64],
    groups: &[Vec<usize>],
    num_tasks: usize,
) -> Result<Vec<ConstraintTask>> {
    balance_groups(groups, num_tasks)
        .into_iter()
        .map(|constraints| ConstraintTask::new(topology, inverse_masses, constraints))
        .collect()
}

/// Solve all tasks in parallel and write their results back.
///
/// Every task gathers its atoms from the global arrays and runs `solve` on
/// its local buffers together with its per-task solver state. Results are
/// scattered back only after all tasks have finished, so the global arrays
/// are never written while tasks still read them.
pub fn solve_tasks<U, R, F>(
    tasks: &mut [ConstraintTask],
    states: &mut [U],
    x: &[[f64; 3]],
    xprime: &mut [[f64; 3]],
    mut v: Option<&mut [[f64; 3]]>,
    solve: F,
) -> Result<Vec<R>>
where
    U: Send,
    R: Send,
    F: Fn(&mut U, TaskBuffers<'_>) -> Result<R> + Sync + Send,
{
    let results = {
        let xprime_in: &[[f64; 3]] = xprime;
        let v_in: Option<&[[f64; 3]]> = v.as_deref();
        tasks
            .par_iter_mut()
            .zip(states.par_iter_mut())
            .map(|(task, state)| {
                task.gather(x, xprime_in, v_in);
                solve(state, task.buffers())
            })
            .collect::<Result<Vec<R>>>()?
    };
    for task in tasks.iter() {
        task.scatter(xprime, v.as_deref_mut());
    }
    Ok(results)
}

/// Assignment of constraints to device threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLayout {
    block_size: usize,
    /// Constraint handled by each thread; `None` for dummy threads.
    thread_constraint: Vec<Option<usize>>,
    /// Thread of each constraint.
    constraint_thread: Vec<usize>,
}

impl BlockLayout {
    /// Pack coupled groups into blocks of `block_size` threads, in order.
    /// A group that would straddle a block boundary is moved to the start of
    /// the next block, leaving dummy threads behind.
    pub fn pack(groups: &[Vec<usize>], num_constraints: usize, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(ConstraintError::InvalidParameter(
                "block size must be positive".to_string(),
            ));
        }
        let mut thread_constraint: Vec<Option<usize>> = Vec::with_capacity(num_constraints);
        let mut constraint_thread = vec![usize::MAX; num_constraints];

        for group in groups {
            if group.len() > block_size {
                return Err(ConstraintError::CoupledGroupTooLarge {
                    group_size: group.len(),
                    block_size,
                    first_constraint: group.first().copied().unwrap_or(0),
                });
            }
            let start = thread_constraint.len();
            let used_in_block = start % block_size;
            if used_in_block + group.len() > block_size {
                let next_block = start + (block_size - used_in_block);
                thread_constraint.resize(next_block, None);
            }
            for &c in group {
                constraint_thread[c] = thread_constraint.len();
                thread_constraint.push(Some(c));
            }
        }
        let num_threads = thread_constraint.len().div_ceil(block_size) * block_size;
        thread_constraint.resize(num_threads, None);

        if let Some(c) = constraint_thread.iter().position(|&t| t == usize::MAX) {
            return Err(ConstraintError::InvalidParameter(format!(
                "constraint {c} is not part of any coupled group"
            )));
        }

        Ok(Self {
            block_size,
            thread_constraint,
            constraint_thread,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_threads(&self) -> usize {
        self.thread_constraint.len()
    }

    pub fn num_blocks(&self) -> usize {
        self.num_threads() / self.block_size
    }

    pub fn num_dummies(&self) -> usize {
        self.thread_constraint.iter().filter(|t| t.is_none()).count()
    }

    #[inline]
    pub fn constraint_of_thread(&self, thread: usize) -> Option<usize> {
        self.thread_constraint[thread]
    }

    #[inline]
    pub fn thread_of_constraint(&self, c: usize) -> usize {
        self.constraint_thread[c]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_keeps_groups_whole() {
        let groups = vec![vec![0, 1, 2], vec![3], vec![4, 5], vec![6]];
        let tasks = balance_groups(&groups, 2);
        assert_eq!(tasks.len(), 2);
        let sizes: Vec<usize> = tasks.iter().map(|t| t.len()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 7);
        assert!(tasks.iter().any(|t| t.starts_with(&[0, 1, 2])));
        assert!(sizes.iter().all(|&s| s >= 3));
    }

    #[test]
    fn test_balance_never_creates_empty_tasks() {
        let tasks = balance_groups(&[vec![0], vec![1]], 8);
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn test_pack_moves_group_to_next_block() {
        let groups = vec![vec![0, 1, 2], vec![3, 4]];
        let layout = BlockLayout::pack(&groups, 5, 4).unwrap();
        assert_eq!(layout.num_threads(), 8);
        assert_eq!(layout.num_blocks(), 2);
        assert_eq!(layout.constraint_of_thread(3), None);
        assert_eq!(layout.thread_of_constraint(3), 4);
        assert_eq!(layout.num_dummies(), 3);
    }

    #[test]
    fn test_pack_rejects_oversized_group() {
        let groups = vec![vec![0], vec![1, 2, 3, 4, 5]];
        let err = BlockLayout::pack(&groups, 6, 4).unwrap_err();
        assert_eq!(
            err,
            ConstraintError::CoupledGroupTooLarge {
                group_size: 5,
                block_size: 4,
                first_constraint: 1
            }
        );
    }

    #[test]
    fn test_task_gather_scatter_roundtrips_selected_atoms() {
        let top = ConstraintTopology::from_triples(5, &[0, 1, 3], &[0.1]).unwrap();
        let inv = vec![1.0; 5];
        let mut task = ConstraintTask::new(&top, &inv, vec![0]).unwrap();
        assert_eq!(task.atoms(), &[1, 3]);

        let x: Vec<[f64; 3]> = (0..5).map(|a| [a as f64, 0.0, 0.0]).collect();
        let mut xprime = x.clone();
        task.gather(&x, &xprime, None);
        assert!(task.buffers().v.is_none());
        task.buffers().xprime[1] = [9.0, 9.0, 9.0];
        task.scatter(&mut xprime, None);
        assert_eq!(xprime[3], [9.0, 9.0, 9.0]);
        assert_eq!(xprime[2], [2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_solve_tasks_writes_back_every_task() {
        let top = ConstraintTopology::from_triples(4, &[0, 0, 1, 0, 2, 3], &[0.1]).unwrap();
        let inv = vec![1.0; 4];
        let mut tasks = build_tasks(&top, &inv, &[vec![0], vec![1]], 2).unwrap();
        assert_eq!(tasks.len(), 2);
        let mut counters = vec![0usize; tasks.len()];

        let x = vec![[0.0; 3]; 4];
        let mut xprime = x.clone();
        let mut v = vec![[0.0; 3]; 4];
        let touched = solve_tasks(
            &mut tasks,
            &mut counters,
            &x,
            &mut xprime,
            Some(&mut v),
            |count, buffers| {
                *count += 1;
                for p in buffers.xprime.iter_mut() {
                    p[0] += 1.0;
                }
                if let Some(v) = buffers.v {
                    v[0][2] = buffers.constraints[0] as f64;
                }
                Ok(buffers.xprime.len())
            },
        )
        .unwrap();
        assert_eq!(touched, vec![2, 2]);
        assert_eq!(counters, vec![1, 1]);
        assert!(xprime.iter().all(|p| p[0] == 1.0));
        assert_eq!(v[2][2], 1.0);
    }
}
