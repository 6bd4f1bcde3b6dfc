use std::collections::VecDeque;

use crate::model::ScanStatus;
use crate::state::SessionId;

/// 一次已结束的扫码记录。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanRecord {
    pub session: SessionId,
    pub code: String,
    pub status: ScanStatus,
    pub message: String,
    pub finished_at_ms: u64,
}

/// 最近扫码记录（定长，满则淘汰最旧）。
#[derive(Clone, Debug)]
pub struct RecentScans {
    max_len: usize,
    records: VecDeque<ScanRecord>,
    success_count: u32,
    error_count: u32,
}

impl RecentScans {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            records: VecDeque::with_capacity(max_len),
            success_count: 0,
            error_count: 0,
        }
    }

    pub fn push(&mut self, record: ScanRecord) {
        match record.status {
            ScanStatus::Success => self.success_count = self.success_count.saturating_add(1),
            ScanStatus::Error => self.error_count = self.error_count.saturating_add(1),
            _ => {}
        }
        if self.max_len == 0 {
            return;
        }
        if self.records.len() >= self.max_len {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// 最新的记录在前。
    pub fn newest_first(&self) -> impl Iterator<Item = &ScanRecord> {
        self.records.iter().rev()
    }

    pub fn success_count(&self) -> u32 {
        self.success_count
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }
}
