//! Decoded picture buffer pool.
//!
//! [`DpbPool`] owns the fixed set of recon/reference picture records used by
//! the encode loop. Records move through three phases: free, transient
//! (granted to the frame currently encoding) and resident (visible to
//! reference-list construction). There is no scattered flag bookkeeping —
//! retirement happens at exactly one point, [`DpbPool::release_unused`],
//! from the active set the caller assembles after list building.
//!
//! The pool is shared across stages behind one mutex; callers lock it for
//! the duration of an allocation or a list build, never across external
//! compute. Building lists and retiring unused records for the same frame
//! must happen under one uninterrupted borrow of the pool so a sibling
//! bitrate instance cannot observe a half-retired pool.

mod record;
mod ref_lists;

pub use record::{FrameRecord, RecordId, RecordPhase};
pub use ref_lists::{RefListEntry, RefLists, ReferenceList};

use itertools::Itertools;

use crate::frame::{DeltaPocList, PixelHandle, SideInfoHandle, SliceType};

/// Fixed-capacity pool of reference picture records.
pub struct DpbPool {
    records: Vec<FrameRecord>,
}

impl DpbPool {
    /// Create a pool of `capacity` free records with sequentially numbered
    /// storage handles.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "DPB pool needs at least one record");
        let records = (0..capacity)
            .map(|i| FrameRecord::free(PixelHandle(i as u32), SideInfoHandle(i as u32)))
            .collect();
        Self { records }
    }

    /// Pool capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    /// Number of records not currently free.
    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.records.iter().filter(|r| !r.is_free()).count()
    }

    /// Read access to a record.
    #[must_use]
    pub fn record(&self, id: RecordId) -> &FrameRecord {
        &self.records[id.0]
    }

    /// Grant a record for a new input frame.
    ///
    /// Scans for a free record first; when none exists, evicts by the
    /// dual-key policy: prefer a non-reference record no live list holds,
    /// otherwise take the minimum (GOP generation, POC) among records no
    /// live list holds. Ties on both keys resolve to the first match in scan
    /// order. The pool is sized at configuration time so that a candidate
    /// always exists; running out is a fatal sizing bug.
    pub fn allocate_free_record(&mut self) -> RecordId {
        if let Some(index) = self.records.iter().position(FrameRecord::is_free) {
            self.records[index].phase = RecordPhase::Transient;
            return RecordId(index);
        }

        let evict = self
            .eviction_candidate()
            .expect("DPB pool exhausted: no evictable record (configuration bug)");
        log::debug!(
            "dpb: evicting record {} (poc {}, gen {})",
            evict.0,
            self.records[evict.0].poc,
            self.records[evict.0].gop_generation
        );
        self.records[evict.0].clear();
        self.records[evict.0].phase = RecordPhase::Transient;
        evict
    }

    /// Pick the eviction victim without mutating the pool.
    ///
    /// `min_by_key` keeps the first minimum it sees, which is exactly the
    /// first-match-in-scan-order tie-break for records sharing both keys.
    fn eviction_candidate(&self) -> Option<RecordId> {
        let evictable = |r: &FrameRecord| r.is_resident() && !r.in_live_list;

        let preferred = self
            .records
            .iter()
            .positions(|r| evictable(r) && !r.is_reference)
            .min_by_key(|&i| (self.records[i].gop_generation, self.records[i].poc));
        if let Some(index) = preferred {
            return Some(RecordId(index));
        }
        self.records
            .iter()
            .positions(evictable)
            .min_by_key(|&i| (self.records[i].gop_generation, self.records[i].poc))
            .map(RecordId)
    }

    /// Move a record from the transient allocation phase into the resident
    /// phase other frames may reference. Invoked once per frame after its
    /// encode completes.
    pub fn mark_record_used(
        &mut self,
        id: RecordId,
        is_reference: bool,
        poc: i32,
        gop_generation: u32,
        slice_type: SliceType,
        slice_qp: i32,
    ) {
        let record = &mut self.records[id.0];
        assert_eq!(
            record.phase,
            RecordPhase::Transient,
            "mark_record_used on record {} in phase {:?}",
            id.0,
            record.phase
        );
        record.phase = RecordPhase::Resident;
        record.is_reference = is_reference;
        record.poc = poc;
        record.gop_generation = gop_generation;
        record.slice_type = slice_type;
        record.frame_qp = slice_qp;
    }

    /// Build the combined L0/L1 reference lists for the frame at
    /// `current_poc` from the lookahead's delta-POC requests.
    ///
    /// Every requested POC must be resident: the lookahead only references
    /// pictures it knows are retained, so a miss is a fatal orchestration
    /// bug, not a recoverable condition. At `current_poc == 0` (sequence
    /// start) no entries are built and both lists are empty.
    pub fn build_reference_lists(
        &mut self,
        request: &DeltaPocList,
        current_poc: i32,
    ) -> RefLists {
        for record in &mut self.records {
            record.in_live_list = false;
        }
        if current_poc == 0 {
            return RefLists::default();
        }

        let mut l0 = ReferenceList::new();
        let mut l1 = ReferenceList::new();
        for req in request {
            if req.duplicate_count == 0 {
                continue;
            }
            let poc = current_poc + req.delta_poc;
            let index = self
                .records
                .iter()
                .position(|r| r.is_resident() && r.poc == poc)
                .unwrap_or_else(|| {
                    panic!("dpb: requested POC {poc} (delta {}) not resident", req.delta_poc)
                });
            self.records[index].in_live_list = true;

            let target = if req.delta_poc <= 0 { &mut l0 } else { &mut l1 };
            for dup in 0..req.duplicate_count as usize {
                target.push(RefListEntry {
                    record: RecordId(index),
                    poc,
                    weight: req.weights.get(dup).copied().unwrap_or_default(),
                    used_by_current: req.used_by_current,
                });
            }
        }

        ref_lists::combine(l0, l1)
    }

    /// Look up the resident record holding `poc`, if any (first match in
    /// scan order, mirroring the list-build lookup).
    #[must_use]
    pub fn find_resident(&self, poc: i32) -> Option<RecordId> {
        self.records.iter().position(|r| r.is_resident() && r.poc == poc).map(RecordId)
    }

    /// Retire every resident record not present in the active set.
    ///
    /// Called once per frame, after list building, on the same pool borrow
    /// that built the lists. Freed records get `poc = INVALID_POC` and drop
    /// their reference flag.
    pub fn release_unused(&mut self, active: &[RecordId]) {
        for (index, record) in self.records.iter_mut().enumerate() {
            if record.is_resident() && !active.contains(&RecordId(index)) {
                log::trace!("dpb: releasing record {index} (poc {})", record.poc);
                record.clear();
            }
        }
    }

    /// Free every record (IDR boundary / end of sequence).
    pub fn flush(&mut self) {
        for record in &mut self.records {
            record.clear();
        }
    }

    /// Conservation check: every record a list references is resident.
    #[must_use]
    pub fn lists_are_resident(&self, lists: &RefLists) -> bool {
        lists.referenced_records().iter().all(|id| self.records[id.0].is_resident())
    }
}
