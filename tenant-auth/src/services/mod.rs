pub mod auth;
pub mod callout;
pub mod domains;
pub mod id;
pub mod pats;
pub mod policy_agent;
pub mod tokenizer;

pub use auth::{AuthService, TokenDurations};
pub use callout::{Callout, CalloutRequest, HttpCallout, NoopCallout};
pub use domains::DomainService;
pub use id::{IdProvider, UuidProvider};
pub use pats::PatService;
pub use policy_agent::{InMemoryPolicyAgent, PolicyAgent, SpiceDbAgent};
pub use tokenizer::Tokenizer;
