//! Strategy templates and their instantiation into concrete legs.

pub mod resolver;
pub mod template;

pub use resolver::{round_to_step, ConcreteLeg, MarketContext, StrategyError, StrategyResolver};
pub use template::{Action, LegTemplate, StrategyDefinition, StrategyKind, StrategyTemplate};
