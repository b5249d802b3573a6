//! Query identity and the immutable session snapshot.

use crate::transaction::TransactionId;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Unique identifier for a query.
///
/// Query IDs are strings assigned by the dispatcher; the controller treats
/// them as opaque.
#[derive(Clone, Hash, Eq, PartialEq, Serialize)]
pub struct QueryId(String);

impl QueryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryId({})", self.0)
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for QueryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A role selection accumulated through `SET ROLE`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum SelectedRole {
    /// Activate a specific role.
    Role(String),
    /// Activate all grantable roles.
    All,
    /// Deactivate all roles.
    None,
}

/// A table read by the query.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize)]
pub struct QueryInput {
    pub catalog: String,
    pub schema: String,
    pub table: String,
}

/// The table written by the query, if any.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueryOutput {
    pub catalog: String,
    pub schema: String,
    pub table: String,
}

/// Immutable per-query session snapshot.
///
/// The session is fixed at query submission; the controller only reads it.
/// Mutations requested by the query itself (SET SESSION, PREPARE, ...) are
/// accumulated on the controller and surfaced through snapshots, never
/// applied here.
#[derive(Clone, Debug, Serialize)]
pub struct Session {
    query_id: QueryId,
    user: String,
    catalog: Option<String>,
    schema: Option<String>,
    transaction_id: Option<TransactionId>,
    prepared_statements: HashMap<String, String>,
    recovery_enabled: bool,
}

impl Session {
    pub fn new(query_id: QueryId, user: impl Into<String>) -> Self {
        Self {
            query_id,
            user: user.into(),
            catalog: None,
            schema: None,
            transaction_id: None,
            prepared_statements: HashMap::new(),
            recovery_enabled: false,
        }
    }

    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Binds the session to a transaction.
    pub fn with_transaction(mut self, transaction_id: TransactionId) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    pub fn with_prepared_statement(
        mut self,
        name: impl Into<String>,
        statement: impl Into<String>,
    ) -> Self {
        self.prepared_statements.insert(name.into(), statement.into());
        self
    }

    pub fn with_recovery_enabled(mut self, enabled: bool) -> Self {
        self.recovery_enabled = enabled;
        self
    }

    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn catalog(&self) -> Option<&str> {
        self.catalog.as_deref()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction_id
    }

    pub fn prepared_statements(&self) -> &HashMap<String, String> {
        &self.prepared_statements
    }

    pub fn recovery_enabled(&self) -> bool {
        self.recovery_enabled
    }
}
