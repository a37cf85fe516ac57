//! Content generation (§4.4): persona-driven prompting through a budget-gated
//! LLM client, with ethics, completeness, duplicate-resistance, and cadence
//! gates applied before anything is handed to the Selector/Publisher.

pub mod critic;
pub mod duplicates;
pub mod ethics;
pub mod generator;
pub mod llm;

pub use ethics::EthicsResult;
pub use generator::{GeneratedContent, Generator, ThreadContent};
pub use llm::{BudgetedLlmClient, ChatMessage, LlmClient, OpenRouterClient};
