pub mod agent;
pub mod extractive;
pub mod mock;
pub mod reliable;

pub use agent::{ResponseAgent, SummarizationAgent};
pub use extractive::ExtractiveSummarizer;
pub use mock::{MockReply, MockResponder, MockSummarizer};
pub use reliable::{ReliableAgent, ReliableConfig};
