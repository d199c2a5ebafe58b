pub mod dispatcher;
pub mod request;

pub use dispatcher::{ActionDispatcher, ResultEnvelope};
pub use request::{ActionRequest, Operation, Payload, Target};

use crate::error::DataApiError;
use std::fmt;
use std::str::FromStr;

/// Operations exposed under `/api/v1/action/{action}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Find,
    FindOne,
    InsertOne,
    InsertMany,
    UpdateOne,
    UpdateMany,
    ReplaceOne,
    DeleteOne,
    DeleteMany,
    Aggregate,
    CountDocuments,
    EstimatedDocumentCount,
    Distinct,
    ListCollections,
    ListDatabases,
}

impl Action {
    /// Wire name to action
    pub const ALL: [(&'static str, Action); 15] = [
        ("find", Action::Find),
        ("findOne", Action::FindOne),
        ("insertOne", Action::InsertOne),
        ("insertMany", Action::InsertMany),
        ("updateOne", Action::UpdateOne),
        ("updateMany", Action::UpdateMany),
        ("replaceOne", Action::ReplaceOne),
        ("deleteOne", Action::DeleteOne),
        ("deleteMany", Action::DeleteMany),
        ("aggregate", Action::Aggregate),
        ("countDocuments", Action::CountDocuments),
        ("estimatedDocumentCount", Action::EstimatedDocumentCount),
        ("distinct", Action::Distinct),
        ("listCollections", Action::ListCollections),
        ("listDatabases", Action::ListDatabases),
    ];

    pub fn name(&self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(_, action)| action == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }

    /// Every action whose name does not contain `find` needs write access.
    ///
    /// This includes read-like actions such as `aggregate` and `distinct`.
    pub fn requires_write(&self) -> bool {
        !self.name().contains("find")
    }

    /// Actions that address a database or cluster rather than one collection
    pub fn is_database_scoped(&self) -> bool {
        matches!(self, Action::ListCollections | Action::ListDatabases)
    }
}

impl FromStr for Action {
    type Err = DataApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, action)| *action)
            .ok_or_else(|| DataApiError::UnknownAction(s.to_string()))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
