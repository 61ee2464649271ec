//! Builds the allocation matrix from an ordered list of parallel groups.

use crate::model::{AllocationCell, JoinPoint, TaskAllocation, TestProcedure};

/// Rectangular `[max_clients x (2*groups+1)]` matrix of [`AllocationCell`]s.
///
/// Every row begins and ends with a join point, groups are separated by join
/// points, and `none` pads rows whose client does not participate in a given
/// group.
pub struct AllocationMatrix {
    pub max_clients: usize,
    /// `rows[client_row][column]`.
    pub rows: Vec<Vec<AllocationCell>>,
}

impl AllocationMatrix {
    /// The physical row a client occupies throughout the whole matrix.
    pub fn row_for_client(&self, global_client_index: usize) -> usize {
        global_client_index % self.max_clients
    }

    /// All join-point columns, left to right — identical across every row by
    /// construction.
    pub fn join_point_ids(&self) -> Vec<u64> {
        self.rows[0]
            .iter()
            .filter_map(|c| c.as_join().map(|j| j.id))
            .collect()
    }

    pub fn width(&self) -> usize {
        self.rows.first().map(|r| r.len()).unwrap_or(0)
    }
}

/// Builds the allocation matrix for a test procedure.
pub fn allocate(procedure: &TestProcedure) -> AllocationMatrix {
    let max_clients = procedure
        .groups
        .iter()
        .map(|g| g.clients_sum())
        .max()
        .unwrap_or(0)
        .max(1);

    let mut rows: Vec<Vec<AllocationCell>> = (0..max_clients).map(|_| Vec::new()).collect();

    let mut join_id = 0u64;
    for row in rows.iter_mut() {
        row.push(AllocationCell::Join(JoinPoint::new(join_id)));
    }
    join_id += 1;

    for group in &procedure.groups {
        let total_clients_in_group = group.clients_sum();
        let mut completing_rows: Vec<usize> = Vec::new();
        let mut occupied = vec![false; max_clients];

        let mut cursor = 0usize;
        for task in &group.tasks {
            for client_index_in_task in 0..task.clients {
                let global_client_index = cursor;
                let physical_row = global_client_index % max_clients;
                let allocation = TaskAllocation {
                    task: task.clone(),
                    client_index_in_task,
                    global_client_index,
                    total_clients_in_parallel_group: total_clients_in_group,
                };
                rows[physical_row].push(AllocationCell::Task(allocation));
                occupied[physical_row] = true;
                if task.completes_parent {
                    completing_rows.push(physical_row);
                }
                cursor += 1;
            }
        }

        for (row_idx, was_occupied) in occupied.iter().enumerate() {
            if !was_occupied {
                rows[row_idx].push(AllocationCell::None);
            }
        }

        let mut jp = JoinPoint::new(join_id);
        jp.clients_executing_completing_task = completing_rows;
        for row in rows.iter_mut() {
            row.push(AllocationCell::Join(jp.clone()));
        }
        join_id += 1;
    }

    AllocationMatrix { max_clients, rows }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OperationRef, ParallelGroup, Task, TimingPolicy};
    use std::collections::HashMap;

    fn op(name: &str) -> OperationRef {
        OperationRef {
            operation_type: "search".into(),
            name: name.into(),
            meta_data: HashMap::new(),
        }
    }

    fn iter_task(name: &str, clients: usize) -> Task {
        Task::new(
            name,
            op(name),
            clients,
            TimingPolicy::Iterations {
                warmup_iterations: 0,
                iterations: Some(1),
            },
        )
    }

    /// Scenario 1: T1(clients=2), T2(clients=1) in one group.
    #[test]
    fn join_point_barrier_scenario() {
        let t1 = iter_task("T1", 2);
        let t2 = iter_task("T2", 1);
        let procedure = TestProcedure {
            name: "p".into(),
            groups: vec![ParallelGroup::new(vec![t1, t2])],
        };

        let matrix = allocate(&procedure);
        assert_eq!(matrix.max_clients, 3);
        assert_eq!(matrix.width(), 3);

        // every row starts and ends with a join point, same ids.
        for row in &matrix.rows {
            assert!(matches!(row[0], AllocationCell::Join(ref j) if j.id == 0));
            assert!(matches!(row[2], AllocationCell::Join(ref j) if j.id == 1));
        }

        // middle column: T1, T1, T2
        assert_eq!(matrix.rows[0][1].as_task().unwrap().task.name, "T1");
        assert_eq!(matrix.rows[1][1].as_task().unwrap().task.name, "T1");
        assert_eq!(matrix.rows[2][1].as_task().unwrap().task.name, "T2");

        // no sub-task is completes_parent, so JP(1)'s completing set is empty.
        let jp1 = matrix.rows[0][2].as_join().unwrap();
        assert!(jp1.clients_executing_completing_task.is_empty());
    }

    /// Scenario 2: completes_parent marks the JoinPoint's completing set.
    #[test]
    fn completes_parent_marks_joinpoint() {
        let t1 = iter_task("T1", 4);
        let t2 = iter_task("T2", 2).completes_parent(true);
        let procedure = TestProcedure {
            name: "p".into(),
            groups: vec![ParallelGroup::new(vec![t1, t2])],
        };

        let matrix = allocate(&procedure);
        assert_eq!(matrix.max_clients, 6);

        let jp1 = matrix.rows[0][matrix.width() - 1].as_join().unwrap();
        assert_eq!(jp1.clients_executing_completing_task.len(), 2);
    }

    #[test]
    fn every_row_has_identical_joinpoint_columns() {
        let t1 = iter_task("T1", 3);
        let t2 = iter_task("T2", 5);
        let procedure = TestProcedure {
            name: "p".into(),
            groups: vec![
                ParallelGroup::new(vec![t1.clone()]),
                ParallelGroup::new(vec![t2]),
            ],
        };
        let matrix = allocate(&procedure);
        let expected_ids = matrix.join_point_ids();
        for row in &matrix.rows {
            let ids: Vec<u64> = row.iter().filter_map(|c| c.as_join().map(|j| j.id)).collect();
            assert_eq!(ids, expected_ids);
        }
    }

    #[test]
    fn padded_rows_get_none() {
        let t1 = iter_task("T1", 1);
        let t2 = iter_task("T2", 5);
        // group 1 only uses 1 client; group 2 uses 5 — max_clients = 5.
        let procedure = TestProcedure {
            name: "p".into(),
            groups: vec![ParallelGroup::new(vec![t1]), ParallelGroup::new(vec![t2])],
        };
        let matrix = allocate(&procedure);
        assert_eq!(matrix.max_clients, 5);
        // column 1 (first group) has only row 0 occupied; rows 1..4 are None.
        for row_idx in 1..5 {
            assert!(matches!(matrix.rows[row_idx][1], AllocationCell::None));
        }
    }
}
