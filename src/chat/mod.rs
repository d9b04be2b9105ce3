// Chat write surface. Message storage itself is a plain CRUD collaborator;
// it lives here because the metering hooks hang off its writes.

pub mod store;

pub use store::{ChatStore, NewAssistantTurn, NewUserTurn};
