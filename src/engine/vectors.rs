//! IRQ-to-vector mapping.

use std::sync::Arc;

use crate::hw::{InterruptController, InterruptHandler, SetupError, Vector, VECTOR_SPACE};
use crate::trace::IrqId;

/// Rollback guard for a partially completed reservation.
///
/// If the guard is dropped before `commit`, every handler assigned so far is
/// cleared and the whole vector range is released, so a failed setup leaves
/// the controller exactly as it found it.
struct Reservation<'a> {
    controller: &'a dyn InterruptController,
    first: Vector,
    count: usize,
    assigned: usize,
    committed: bool,
}

impl<'a> Reservation<'a> {
    fn new(controller: &'a dyn InterruptController, first: Vector, count: usize) -> Self {
        Self {
            controller,
            first,
            count,
            assigned: 0,
            committed: false,
        }
    }

    fn record_assigned(&mut self) {
        self.assigned += 1;
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for i in 0..self.assigned {
            self.controller.clear_handler(self.first + i as Vector);
        }
        self.controller.release_range(self.first, self.count);
    }
}

/// The table routing IRQ identifiers to concrete hardware vectors.
///
/// Built once from a contiguous reserved range; immutable thereafter. Since
/// each identifier gets its own offset into the range, no two identifiers can
/// alias the same vector.
pub struct VectorMap {
    first: Vector,
    count: usize,
    map: [Option<Vector>; VECTOR_SPACE],
}

impl VectorMap {
    /// Reserve a contiguous range of vectors, one per IRQ identifier, and
    /// install `handler` on each.
    ///
    /// The identifiers must already be validated as distinct. On any failure
    /// the partially built reservation is rolled back before returning.
    pub fn reserve(
        controller: &dyn InterruptController,
        irqs: &[IrqId],
        handler: &Arc<dyn InterruptHandler>,
    ) -> Result<Self, SetupError> {
        let first = controller.reserve_range(irqs.len())?;
        let mut reservation = Reservation::new(controller, first, irqs.len());

        let mut map = [None; VECTOR_SPACE];
        for (i, irq) in irqs.iter().enumerate() {
            let vector = first + i as Vector;
            controller.assign_handler(vector, Arc::clone(handler))?;
            reservation.record_assigned();
            map[irq.index()] = Some(vector);
        }
        reservation.commit();

        Ok(Self {
            first,
            count: irqs.len(),
            map,
        })
    }

    /// The vector mapped to `irq`, if any.
    pub fn vector(&self, irq: IrqId) -> Option<Vector> {
        self.map[irq.index()]
    }

    /// First vector of the reserved range.
    pub fn first(&self) -> Vector {
        self.first
    }

    /// Number of mapped vectors.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::hw::CpuId;

    /// Controller mock that records calls and can fail assignment at a
    /// chosen point.
    struct MockController {
        fail_assign_at: Option<usize>,
        reserves: Mutex<usize>,
        assigned: Mutex<Vec<Vector>>,
        cleared: Mutex<Vec<Vector>>,
        released: Mutex<Vec<(Vector, usize)>>,
    }

    impl MockController {
        fn new(fail_assign_at: Option<usize>) -> Self {
            Self {
                fail_assign_at,
                reserves: Mutex::new(0),
                assigned: Mutex::new(Vec::new()),
                cleared: Mutex::new(Vec::new()),
                released: Mutex::new(Vec::new()),
            }
        }
    }

    impl InterruptController for MockController {
        fn reserve_range(&self, _count: usize) -> Result<Vector, SetupError> {
            *self.reserves.lock().unwrap() += 1;
            Ok(64)
        }

        fn release_range(&self, first: Vector, count: usize) {
            self.released.lock().unwrap().push((first, count));
        }

        fn assign_handler(
            &self,
            vector: Vector,
            _handler: Arc<dyn InterruptHandler>,
        ) -> Result<(), SetupError> {
            let mut assigned = self.assigned.lock().unwrap();
            if self.fail_assign_at == Some(assigned.len()) {
                return Err(SetupError::VectorBusy { vector });
            }
            assigned.push(vector);
            Ok(())
        }

        fn clear_handler(&self, vector: Vector) {
            self.cleared.lock().unwrap().push(vector);
        }

        fn send_ipi(&self, _cpu: CpuId, _vector: Vector) {}

        fn end_of_interrupt(&self) {}
    }

    struct NullHandler;

    impl InterruptHandler for NullHandler {
        fn handle(&self, _vector: Vector) {}
    }

    fn handler() -> Arc<dyn InterruptHandler> {
        Arc::new(NullHandler)
    }

    #[test]
    fn test_mapping_is_disjoint() {
        let controller = MockController::new(None);
        let irqs = [IrqId(3), IrqId(7), IrqId(9)];

        let map = VectorMap::reserve(&controller, &irqs, &handler()).unwrap();

        assert_eq!(map.len(), 3);
        assert_eq!(map.vector(IrqId(3)), Some(64));
        assert_eq!(map.vector(IrqId(7)), Some(65));
        assert_eq!(map.vector(IrqId(9)), Some(66));
        assert_eq!(map.vector(IrqId(4)), None);

        // Successful setup rolls nothing back.
        assert!(controller.cleared.lock().unwrap().is_empty());
        assert!(controller.released.lock().unwrap().is_empty());
    }

    #[test]
    fn test_reservation_failure_propagates() {
        struct NoRange;

        impl InterruptController for NoRange {
            fn reserve_range(&self, count: usize) -> Result<Vector, SetupError> {
                Err(SetupError::NoContiguousRange { count })
            }
            fn release_range(&self, _first: Vector, _count: usize) {}
            fn assign_handler(
                &self,
                _vector: Vector,
                _handler: Arc<dyn InterruptHandler>,
            ) -> Result<(), SetupError> {
                unreachable!("assignment must not be attempted without a range")
            }
            fn clear_handler(&self, _vector: Vector) {}
            fn send_ipi(&self, _cpu: CpuId, _vector: Vector) {}
            fn end_of_interrupt(&self) {}
        }

        let result = VectorMap::reserve(&NoRange, &[IrqId(1)], &handler());
        assert_eq!(
            result.err(),
            Some(SetupError::NoContiguousRange { count: 1 })
        );
    }

    #[test]
    fn test_assignment_failure_rolls_back() {
        // Third assignment fails; the first two must be cleared and the
        // whole range released.
        let controller = MockController::new(Some(2));
        let irqs = [IrqId(1), IrqId(2), IrqId(3), IrqId(4)];

        let result = VectorMap::reserve(&controller, &irqs, &handler());

        assert_eq!(result.err(), Some(SetupError::VectorBusy { vector: 66 }));
        assert_eq!(*controller.cleared.lock().unwrap(), vec![64, 65]);
        assert_eq!(*controller.released.lock().unwrap(), vec![(64, 4)]);
    }
}
