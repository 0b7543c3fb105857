// Transaction boundary detection shared by both dialects.
//
// The proxy generates its own correlation id on BEGIN; the database never
// sees it. Implicit transactions (SET AUTOCOMMIT=0, savepoints) are not
// detected, so events outside an explicit BEGIN carry an empty id.
use sqltap_common::{ids::TxId, Op};

pub(crate) struct TxTracker {
    begin_prefixes: &'static [&'static str],
    active: Option<TxId>,
}

pub(crate) struct TxDecision {
    pub tx_id: String,
    pub op: Op,
}

impl TxTracker {
    pub(crate) fn postgres() -> Self {
        Self {
            begin_prefixes: &["BEGIN"],
            active: None,
        }
    }

    pub(crate) fn mysql() -> Self {
        Self {
            begin_prefixes: &["BEGIN", "START TRANSACTION"],
            active: None,
        }
    }

    // Classify `query` and update the active-transaction state. BEGIN mints
    // a fresh id; COMMIT/ROLLBACK repeat the active id on the terminator
    // event itself, then clear it.
    pub(crate) fn observe(&mut self, query: &str, default_op: Op) -> TxDecision {
        let upper = query.trim().to_uppercase();

        if self.begin_prefixes.iter().any(|p| upper.starts_with(p)) {
            let id = TxId::new();
            self.active = Some(id);
            return TxDecision {
                tx_id: id.to_string(),
                op: Op::Begin,
            };
        }
        if upper.starts_with("COMMIT") {
            return TxDecision {
                tx_id: self.take_active(),
                op: Op::Commit,
            };
        }
        if upper.starts_with("ROLLBACK") {
            return TxDecision {
                tx_id: self.take_active(),
                op: Op::Rollback,
            };
        }

        TxDecision {
            tx_id: self
                .active
                .map(|id| id.to_string())
                .unwrap_or_default(),
            op: default_op,
        }
    }

    fn take_active(&mut self) -> String {
        self.active
            .take()
            .map(|id| id.to_string())
            .unwrap_or_default()
    }
}
