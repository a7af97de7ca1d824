// jumpgate-terminal: terminal input parsing and command policy
//
// Reconstructs shell-level commands from the raw keystroke stream of a
// live session and classifies each committed command against the asset's
// command rules before the input reaches the target.

mod parser;
mod rules;

pub use parser::{TermParser, LINE_CANCEL};
pub use rules::{CommandRule, CompiledRules, RuleAction, RuleCategory};
