//! GraphQL Payload Types
//!
//! Request and response bodies carried inside protocol frames. These are
//! shared with the plain request/response path, which lives outside this
//! crate.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A GraphQL operation: document, variables and optional operation name.
///
/// # Wire Format (JSON)
/// ```json
/// {"query": "subscription { messageAdded { content } }", "variables": {}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    /// The GraphQL document.
    pub query: String,

    /// Variables referenced by the document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,

    /// Name of the operation to run when the document holds several.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

impl GraphQLRequest {
    /// Create a request from a document.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: None,
            operation_name: None,
        }
    }

    /// Attach variables.
    #[must_use]
    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Select a named operation.
    #[must_use]
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

/// A single error entry of a GraphQL response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    /// Human readable description.
    pub message: String,

    /// Source locations the error refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Value>,

    /// Response path the error refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Value>,

    /// Server specific details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

/// A (partial) GraphQL execution result.
///
/// # Wire Format (JSON)
/// ```json
/// {"data": {"messageAdded": {"content": "Hello World"}}}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLResponse {
    /// Result data, absent when execution failed before producing any.
    #[serde(default)]
    pub data: Option<Value>,

    /// Execution errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<GraphQLError>>,

    /// Server specific metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLResponse {
    /// Check whether the response carries execution errors.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.errors.as_ref().is_some_and(|e| !e.is_empty())
    }

    /// Look up a value in `data` by a `/`-separated JSON pointer.
    ///
    /// ```rust
    /// use graphql_ws_transport::GraphQLResponse;
    ///
    /// let response: GraphQLResponse = serde_json::from_str(
    ///     r#"{"data":{"messageAdded":{"content":"Hello World"}}}"#,
    /// ).unwrap();
    /// assert_eq!(
    ///     response.pointer("/messageAdded/content").and_then(|v| v.as_str()),
    ///     Some("Hello World"),
    /// );
    /// ```
    #[must_use]
    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|d| d.pointer(pointer))
    }
}
