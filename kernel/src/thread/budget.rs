//! CPU budget accounting
//!
//! Every clock tick is charged to the thread executing on each processor.
//! Only preemptible, ready threads have their budget consumed.

use crate::error::ScoreResult;
use crate::percpu::CpuIndex;
use crate::score::Score;

use super::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BudgetAlgorithm {
    /// Run until blocked or preempted
    #[default]
    None,
    /// Timeslice, refilled at every context switch
    ResetTimeslice,
    /// Timeslice, refilled only when exhausted
    ExhaustTimeslice,
    /// Call out when the budget reaches zero
    Callout,
}

impl BudgetAlgorithm {
    pub fn is_timeslice(self) -> bool {
        matches!(self, Self::ResetTimeslice | Self::ExhaustTimeslice)
    }
}

pub type BudgetCallout = fn(&mut Score, ThreadId);

enum BudgetOutcome {
    Nothing,
    Yield,
    Callout(BudgetCallout),
}

impl Score {
    /// Charge one tick to the thread executing on `cpu`
    pub(crate) fn tickle_timeslice(&mut self, cpu: CpuIndex) {
        let Some(id) = self.cpus[cpu].executing else {
            return;
        };
        let ticks_per_timeslice = self.config.ticks_per_timeslice;

        let outcome = match self.threads.get_mut(id) {
            None => BudgetOutcome::Nothing,
            Some(thread) => {
                thread.cpu_time_used += 1;
                if !thread.is_preemptible || !thread.current_state.is_ready() {
                    BudgetOutcome::Nothing
                } else {
                    match thread.budget_algorithm {
                        BudgetAlgorithm::None => BudgetOutcome::Nothing,
                        BudgetAlgorithm::ResetTimeslice | BudgetAlgorithm::ExhaustTimeslice => {
                            thread.cpu_time_budget = thread.cpu_time_budget.saturating_sub(1);
                            if thread.cpu_time_budget == 0 {
                                thread.cpu_time_budget = ticks_per_timeslice;
                                BudgetOutcome::Yield
                            } else {
                                BudgetOutcome::Nothing
                            }
                        }
                        BudgetAlgorithm::Callout => {
                            if thread.cpu_time_budget > 0 {
                                thread.cpu_time_budget -= 1;
                                if thread.cpu_time_budget == 0 {
                                    thread
                                        .budget_callout
                                        .map_or(BudgetOutcome::Nothing, BudgetOutcome::Callout)
                                } else {
                                    BudgetOutcome::Nothing
                                }
                            } else {
                                BudgetOutcome::Nothing
                            }
                        }
                    }
                }
            }
        };

        match outcome {
            BudgetOutcome::Nothing => {}
            BudgetOutcome::Yield => {
                log::trace!("[BUDGET] {} timeslice exhausted", id);
                self.yield_thread(id);
            }
            BudgetOutcome::Callout(callout) => callout(self, id),
        }
    }

    /// Refill the timeslice of a thread being switched in
    pub(crate) fn reset_timeslice_on_switch(&mut self, id: ThreadId) {
        let ticks_per_timeslice = self.config.ticks_per_timeslice;
        if let Some(thread) = self.threads.get_mut(id) {
            if thread.budget_algorithm == BudgetAlgorithm::ResetTimeslice {
                thread.cpu_time_budget = ticks_per_timeslice;
            }
        }
    }

    /// Change the budget algorithm of `id`
    ///
    /// `budget` is only used by [`BudgetAlgorithm::Callout`]; the timeslice
    /// algorithms start from a full timeslice.
    pub fn set_cpu_budget(
        &mut self,
        id: ThreadId,
        algorithm: BudgetAlgorithm,
        callout: Option<BudgetCallout>,
        budget: u32,
    ) -> ScoreResult<()> {
        let ticks_per_timeslice = self.config.ticks_per_timeslice;
        let thread = self.thread_mut_or_err(id)?;
        thread.budget_algorithm = algorithm;
        thread.budget_callout = callout;
        thread.cpu_time_budget = if algorithm == BudgetAlgorithm::Callout {
            budget
        } else {
            ticks_per_timeslice
        };
        Ok(())
    }

    pub fn set_preemptible(&mut self, id: ThreadId, is_preemptible: bool) -> ScoreResult<()> {
        self.thread_mut_or_err(id)?.is_preemptible = is_preemptible;
        Ok(())
    }
}
