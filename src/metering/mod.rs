// Usage metering: per-turn cost computation and the additive daily ledger.

pub mod cost;
pub mod ledger;
pub mod pricing;

pub use cost::{CostEngine, CostOutcome, CostTrigger};
pub use ledger::UsageLedger;
pub use pricing::{PricingSnapshot, MAX_BILLED_INPUT_IMAGES, MAX_BILLED_WEB_RESULTS};
