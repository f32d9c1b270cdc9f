use std::collections::BTreeSet;

use tokio::task::AbortHandle;

use crate::host::{ExecutionKey, TerminalInfo};

/// Per-terminal counters. Only the multiplexer writes these.
#[derive(Debug)]
pub(crate) struct Session {
    pub id: u32,
    pub info: TerminalInfo,
    pub seq: u32,
    pub next_exec_id: u32,
    pub has_emitted_output: bool,
    pub executions: BTreeSet<ExecutionKey>,
}

impl Session {
    pub fn new(id: u32, info: TerminalInfo) -> Self {
        Self {
            id,
            info,
            seq: 0,
            next_exec_id: 1,
            has_emitted_output: false,
            executions: BTreeSet::new(),
        }
    }

    /// Current sequence number; advances the counter with wrap-around.
    pub fn take_seq(&mut self) -> u32 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    pub fn allocate_exec_id(&mut self) -> u32 {
        let id = self.next_exec_id;
        self.next_exec_id = self.next_exec_id.wrapping_add(1).max(1);
        id
    }
}

/// One command in flight.
#[derive(Debug)]
pub(crate) struct ExecutionHandle {
    pub terminal_id: u32,
    pub exec_id: u32,
    pub reader: Option<AbortHandle>,
    pub drained: bool,
    /// Exit reported by the host before the reader finished.
    pub pending_exit: Option<Option<i32>>,
}

impl ExecutionHandle {
    pub fn abort(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::TerminalKey;

    #[test_timeout::timeout]
    fn seq_wraps_and_exec_ids_skip_zero() {
        let mut session = Session::new(1, TerminalInfo::new(TerminalKey(1), "zsh"));
        session.seq = u32::MAX;
        assert_eq!(session.take_seq(), u32::MAX);
        assert_eq!(session.take_seq(), 0);

        session.next_exec_id = u32::MAX;
        assert_eq!(session.allocate_exec_id(), u32::MAX);
        assert_eq!(session.allocate_exec_id(), 1);
    }
}
