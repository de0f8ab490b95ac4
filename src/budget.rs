use crate::error::StorageResult;
use crate::store::StoreContext;
use rusqlite::params;

/// Append-only log of per-site privacy budget debits.
pub struct BudgetLedger<'a> {
    ctx: StoreContext<'a>,
}

impl<'a> BudgetLedger<'a> {
    pub fn new(ctx: StoreContext<'a>) -> Self {
        Self { ctx }
    }

    pub fn withdraw(&self, site: &str, bits: f64) -> StorageResult<()> {
        debug_assert!(bits > 0.0, "budget debits must be positive");
        self.ctx
            .conn()?
            .prepare_cached(
                "INSERT INTO budget_mapping(context_site,time_stamp,bits_debit) VALUES(?1,?2,?3)",
            )?
            .execute(params![site, self.ctx.now_micros(), bits])?;
        Ok(())
    }

    /// `bit_budget` minus debits inside the trailing window. Overspending
    /// shows up as a negative balance.
    pub fn remaining(&self, site: &str) -> StorageResult<f64> {
        let spent: Option<f64> = self
            .ctx
            .conn()?
            .prepare_cached(
                "SELECT SUM(bits_debit) FROM budget_mapping \
                 WHERE context_site=?1 AND time_stamp>=?2",
            )?
            .query_row(params![site, self.ctx.budget_cutoff()], |row| row.get(0))?;
        Ok(self.ctx.config.bit_budget - spent.unwrap_or(0.0))
    }

    pub fn reset_site(&self, site: &str) -> StorageResult<usize> {
        let removed = self
            .ctx
            .conn()?
            .prepare_cached("DELETE FROM budget_mapping WHERE context_site=?1")?
            .execute([site])?;
        Ok(removed)
    }

    /// Drops withdrawals that fell out of the window.
    pub fn purge_expired(&self) -> StorageResult<usize> {
        let removed = self
            .ctx
            .conn()?
            .prepare_cached("DELETE FROM budget_mapping WHERE time_stamp<?1")?
            .execute([self.ctx.budget_cutoff()])?;
        Ok(removed)
    }

    /// Rows recorded for `site`, including ones outside the window.
    pub fn entry_count(&self, site: &str) -> StorageResult<i64> {
        let count = self
            .ctx
            .conn()?
            .prepare_cached("SELECT COUNT(*) FROM budget_mapping WHERE context_site=?1")?
            .query_row([site], |row| row.get(0))?;
        Ok(count)
    }

    pub fn total_entry_count(&self) -> StorageResult<i64> {
        let count = self
            .ctx
            .conn()?
            .prepare_cached("SELECT COUNT(*) FROM budget_mapping")?
            .query_row([], |row| row.get(0))?;
        Ok(count)
    }
}
