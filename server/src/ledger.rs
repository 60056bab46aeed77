// Copyright 2025 Oxide Computer Company
//! Per-client durable completion ledger (the `last_rcvd` analog).
//!
//! Every connected client owns one fixed-size record slot holding the last
//! transaction it completed: transno, xid, result, and a few op-specific
//! auxiliary words.  The record is written in the same store transaction
//! as the operation's own side effects, which is what makes replay
//! idempotent: a replayed or resent request finds the slot already
//! advanced and reconstructs the prior reply instead of re-executing.
//!
//! Slot 0 is reserved for the server's own self-record (identity plus the
//! transno high-water mark); client slots are found by bitmap-style search
//! over the remaining table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use slog::{info, o, warn, Logger};
use uuid::Uuid;

use crate::store::{ObjectStore, Txn};
use talus_common::TalusError;
use talus_protocol::{Transno, Xid};

/// Slot reserved for the server's self-record.
pub const SELF_SLOT: usize = 0;

/// One ledger slot, as persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub client_id: Uuid,
    pub last_transno: Transno,
    pub last_xid: Xid,
    pub last_result: Result<(), TalusError>,
    /// Op-specific auxiliary words, enough to reconstruct the reply body
    /// (e.g. the created object's identity, or an unlink's layout hint).
    pub last_opdata: [u64; 4],
}

impl LedgerRecord {
    fn fresh(client_id: Uuid) -> LedgerRecord {
        LedgerRecord {
            client_id,
            last_transno: Transno::NONE,
            last_xid: Xid(0),
            last_result: Ok(()),
            last_opdata: [0; 4],
        }
    }
}

struct LedgerInner {
    slots: Vec<Option<LedgerRecord>>,
    by_client: HashMap<Uuid, usize>,
    /// Last assigned transno; assignment only moves forward.
    next_transno: u64,
    /// Highest transno known durable.
    last_committed: Transno,
}

pub struct ClientLedger {
    store: Arc<dyn ObjectStore>,
    server_id: Uuid,
    inner: Mutex<LedgerInner>,
    log: Logger,
}

impl ClientLedger {
    /// Open the ledger on a store, restoring any surviving records.
    ///
    /// Returns the ledger plus the records of clients that were connected
    /// when the previous incarnation went down; each seeds an
    /// export-under-recovery and contributes to the recovery-completion
    /// threshold.
    pub fn open(
        store: Arc<dyn ObjectStore>,
        server_id: Uuid,
        max_clients: usize,
        log: &Logger,
    ) -> Result<(ClientLedger, Vec<LedgerRecord>), TalusError> {
        assert!(max_clients > 1, "need at least one client slot");
        let log = log.new(o!("" => "ledger"));

        let mut slots: Vec<Option<LedgerRecord>> = vec![None; max_clients];
        let mut by_client = HashMap::new();
        let mut recoverable = Vec::new();
        let mut next_transno = 0;

        let present = store.record_count().min(max_clients);
        for slot in 0..present {
            let Some(bytes) = store.read_record(slot)? else {
                continue;
            };
            let rec: LedgerRecord = bincode::deserialize(&bytes)?;
            next_transno = next_transno.max(rec.last_transno.0);
            if slot == SELF_SLOT {
                slots[SELF_SLOT] = Some(rec);
                continue;
            }
            info!(
                log,
                "slot {} holds client {} at transno {}",
                slot,
                rec.client_id,
                rec.last_transno
            );
            by_client.insert(rec.client_id, slot);
            recoverable.push(rec.clone());
            slots[slot] = Some(rec);
        }

        // A restored self-record carries the target's durable identity;
        // the caller's fresh uuid only applies to a virgin store.
        let server_id = slots[SELF_SLOT]
            .as_ref()
            .map(|r| r.client_id)
            .unwrap_or(server_id);

        let ledger = ClientLedger {
            store,
            server_id,
            inner: Mutex::new(LedgerInner {
                slots,
                by_client,
                next_transno,
                // Everything a restored store contains is durable by
                // definition.
                last_committed: Transno(next_transno),
            }),
            log,
        };

        // Seed the self-record on a virgin store.
        {
            let mut inner = ledger.inner.lock().unwrap();
            if inner.slots[SELF_SLOT].is_none() {
                let rec = LedgerRecord::fresh(server_id);
                let txn = ledger.store.begin(1);
                ledger.persist(&txn, SELF_SLOT, &rec)?;
                ledger.store.commit(txn)?;
                inner.slots[SELF_SLOT] = Some(rec);
            }
        }

        Ok((ledger, recoverable))
    }

    fn persist(
        &self,
        txn: &Txn,
        slot: usize,
        rec: &LedgerRecord,
    ) -> Result<(), TalusError> {
        let bytes = bincode::serialize(rec)?;
        self.store.write_record(txn, slot, &bytes)
    }

    /// Find or allocate this client's slot.  Returns `(slot, restored)`;
    /// `restored` is true when the slot survived from a previous
    /// connection or server incarnation.
    pub fn attach(
        &self,
        client_id: Uuid,
    ) -> Result<(usize, bool), TalusError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&slot) = inner.by_client.get(&client_id) {
            return Ok((slot, true));
        }

        // Free-slot search over the fixed table, slot 0 excluded.
        let Some(slot) =
            (1..inner.slots.len()).find(|s| inner.slots[*s].is_none())
        else {
            warn!(self.log, "no free slot for client {}", client_id);
            return Err(TalusError::LedgerFull);
        };

        let rec = LedgerRecord::fresh(client_id);
        let txn = self.store.begin(1);
        self.persist(&txn, slot, &rec)?;
        self.store.commit(txn)?;
        inner.slots[slot] = Some(rec);
        inner.by_client.insert(client_id, slot);
        info!(self.log, "client {} attached to slot {}", client_id, slot);
        Ok((slot, false))
    }

    /// Release a client's slot.  A clean disconnect zeroes it; a failover
    /// disconnect preserves it for later reconnection.
    pub fn detach(
        &self,
        client_id: Uuid,
        failover: bool,
    ) -> Result<(), TalusError> {
        if failover {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        let Some(slot) = inner.by_client.remove(&client_id) else {
            return Ok(());
        };
        inner.slots[slot] = None;
        let txn = self.store.begin(1);
        self.store.write_record(&txn, slot, &[])?;
        self.store.commit(txn)?;
        info!(self.log, "client {} detached from slot {}", client_id, slot);
        Ok(())
    }

    /// Assign the transno for a request.
    ///
    /// A replay carrying its original nonzero transno keeps it (raising
    /// the high-water mark if needed); anything else gets the next value.
    /// Assignment is strictly increasing per target and never reuses a
    /// value.
    pub fn assign_transno(&self, requested: Transno) -> Transno {
        let mut inner = self.inner.lock().unwrap();
        if !requested.is_none() {
            inner.next_transno = inner.next_transno.max(requested.0);
            return requested;
        }
        inner.next_transno += 1;
        Transno(inner.next_transno)
    }

    /// True exactly when the request's xid matches the slot's last
    /// completed xid; the caller must then skip all side effects and
    /// reconstruct the reply from the returned record.
    pub fn is_resent_duplicate(
        &self,
        slot: usize,
        xid: Xid,
    ) -> Option<LedgerRecord> {
        let inner = self.inner.lock().unwrap();
        inner.slots.get(slot)?.as_ref().and_then(|rec| {
            if rec.last_xid == xid {
                Some(rec.clone())
            } else {
                None
            }
        })
    }

    /// Durably record a completed request in the same transaction as its
    /// side effects.  Only moves forward: a completion older than what
    /// the slot already holds is dropped rather than letting a stale
    /// replay overwrite a later state.
    pub fn record_completion(
        &self,
        txn: &Txn,
        slot: usize,
        transno: Transno,
        xid: Xid,
        result: Result<(), TalusError>,
        opdata: [u64; 4],
    ) -> Result<(), TalusError> {
        let mut inner = self.inner.lock().unwrap();
        let next_transno = inner.next_transno;
        let Some(Some(rec)) = inner.slots.get_mut(slot) else {
            return Err(TalusError::IoError(format!(
                "completion for unknown ledger slot {}",
                slot
            )));
        };
        if !transno.is_none() && transno < rec.last_transno {
            warn!(
                self.log,
                "stale completion (transno {} < {}) dropped",
                transno,
                rec.last_transno
            );
            return Ok(());
        }
        if !transno.is_none() {
            rec.last_transno = transno;
        }
        rec.last_xid = xid;
        rec.last_result = result;
        rec.last_opdata = opdata;
        let rec = rec.clone();
        self.persist(txn, slot, &rec)?;

        // Keep the self-record's high-water mark current in the same
        // transaction.
        if let Some(Some(self_rec)) = inner.slots.get_mut(SELF_SLOT) {
            self_rec.last_transno = Transno(next_transno);
            let self_rec = self_rec.clone();
            self.persist(txn, SELF_SLOT, &self_rec)?;
        }
        Ok(())
    }

    /// Commit notification: `transno` is now durable.
    pub fn mark_committed(&self, transno: Transno) {
        let mut inner = self.inner.lock().unwrap();
        if transno > inner.last_committed {
            inner.last_committed = transno;
        }
    }

    pub fn last_committed(&self) -> Transno {
        self.inner.lock().unwrap().last_committed
    }

    pub fn server_id(&self) -> Uuid {
        self.server_id
    }

    pub fn slot_of(&self, client_id: Uuid) -> Option<usize> {
        self.inner.lock().unwrap().by_client.get(&client_id).copied()
    }

    pub fn connected_clients(&self) -> usize {
        self.inner.lock().unwrap().by_client.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::MemStore;

    fn csl() -> Logger {
        talus_common::build_plain_logger()
    }

    fn fresh_ledger(max: usize) -> (Arc<MemStore>, ClientLedger) {
        let store = Arc::new(MemStore::new());
        let (ledger, recovered) = ClientLedger::open(
            store.clone(),
            Uuid::new_v4(),
            max,
            &csl(),
        )
        .unwrap();
        assert!(recovered.is_empty());
        (store, ledger)
    }

    #[test]
    fn attach_detach_slot_reuse() {
        let (_store, ledger) = fresh_ledger(4);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let (slot_a, restored) = ledger.attach(a).unwrap();
        assert!(!restored);
        let (slot_b, _) = ledger.attach(b).unwrap();
        assert_ne!(slot_a, slot_b);
        assert_ne!(slot_a, SELF_SLOT);

        // Same client re-attaches to the same slot.
        assert_eq!(ledger.attach(a).unwrap(), (slot_a, true));

        // Clean detach frees the slot for a newcomer.
        ledger.detach(a, false).unwrap();
        let c = Uuid::new_v4();
        assert_eq!(ledger.attach(c).unwrap().0, slot_a);
    }

    #[test]
    fn failover_detach_preserves_slot() {
        let (_store, ledger) = fresh_ledger(4);
        let a = Uuid::new_v4();
        let (slot, _) = ledger.attach(a).unwrap();
        ledger.detach(a, true).unwrap();
        assert_eq!(ledger.attach(a).unwrap(), (slot, true));
    }

    #[test]
    fn ledger_full_is_a_distinct_error() {
        let (_store, ledger) = fresh_ledger(3);
        ledger.attach(Uuid::new_v4()).unwrap();
        ledger.attach(Uuid::new_v4()).unwrap();
        assert_eq!(
            ledger.attach(Uuid::new_v4()).unwrap_err(),
            TalusError::LedgerFull
        );
    }

    #[test]
    fn transnos_strictly_increase_under_concurrency() {
        let (_store, ledger) = fresh_ledger(4);
        let ledger = Arc::new(ledger);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(std::thread::spawn(move || {
                (0..500)
                    .map(|_| ledger.assign_transno(Transno::NONE))
                    .collect::<Vec<_>>()
            }));
        }
        let mut all = Vec::new();
        for h in handles {
            let got = h.join().unwrap();
            for w in got.windows(2) {
                assert!(w[0] < w[1]);
            }
            all.extend(got);
        }
        let n = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), n, "transnos are never reused");
    }

    #[test]
    fn replay_transno_is_retained_and_raises_high_water() {
        let (_store, ledger) = fresh_ledger(4);
        assert_eq!(ledger.assign_transno(Transno(40)), Transno(40));
        // The next fresh assignment lands above the replayed value.
        assert_eq!(ledger.assign_transno(Transno::NONE), Transno(41));
    }

    #[test]
    fn duplicate_detection_is_exact_xid_match() {
        let (store, ledger) = fresh_ledger(4);
        let a = Uuid::new_v4();
        let (slot, _) = ledger.attach(a).unwrap();

        let txn = store.begin(1);
        ledger
            .record_completion(
                &txn,
                slot,
                Transno(7),
                Xid(100),
                Ok(()),
                [55, 1, 0, 0],
            )
            .unwrap();
        store.commit(txn).unwrap();

        let rec = ledger.is_resent_duplicate(slot, Xid(100)).unwrap();
        assert_eq!(rec.last_transno, Transno(7));
        assert_eq!(rec.last_opdata[0], 55);
        assert!(ledger.is_resent_duplicate(slot, Xid(101)).is_none());
    }

    #[test]
    fn stale_completion_cannot_overwrite() {
        let (store, ledger) = fresh_ledger(4);
        let a = Uuid::new_v4();
        let (slot, _) = ledger.attach(a).unwrap();

        let txn = store.begin(1);
        ledger
            .record_completion(&txn, slot, Transno(9), Xid(5), Ok(()), [0; 4])
            .unwrap();
        ledger
            .record_completion(&txn, slot, Transno(3), Xid(4), Ok(()), [0; 4])
            .unwrap();
        store.commit(txn).unwrap();

        let rec = ledger.is_resent_duplicate(slot, Xid(5)).unwrap();
        assert_eq!(rec.last_transno, Transno(9));
    }

    #[test]
    fn restart_restores_clients_and_high_water() {
        let store = Arc::new(MemStore::new());
        let server = Uuid::new_v4();
        let a = Uuid::new_v4();
        let slot = {
            let (ledger, _) =
                ClientLedger::open(store.clone(), server, 8, &csl())
                    .unwrap();
            let (slot, _) = ledger.attach(a).unwrap();
            let txn = store.begin(1);
            ledger
                .record_completion(
                    &txn,
                    slot,
                    ledger.assign_transno(Transno::NONE),
                    Xid(9),
                    Ok(()),
                    [0; 4],
                )
                .unwrap();
            store.commit(txn).unwrap();
            slot
            // Ledger dropped here: the "crash".
        };

        let (ledger, recovered) =
            ClientLedger::open(store.clone(), server, 8, &csl()).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].client_id, a);
        assert_eq!(ledger.slot_of(a), Some(slot));
        // High-water restored: the next transno continues the sequence.
        assert_eq!(ledger.assign_transno(Transno::NONE), Transno(2));
    }
}
