//! Request/response pairs grouped under one correlation id.

use serde::{Deserialize, Serialize};

use super::envelope::{Request, Response};
use crate::error::BridgeError;

/// One request and, once it arrives, its response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub request: Request,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
}

/// Work items sharing a correlation id.
///
/// Items are only ever appended, and only until the unit is completed by
/// [`WorkItems::resolve`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItems {
    correlation_id: String,
    work_items: Vec<WorkItem>,
    #[serde(default)]
    complete: bool,
}

impl WorkItems {
    #[must_use]
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            work_items: Vec::new(),
            complete: false,
        }
    }

    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    #[must_use]
    pub fn items(&self) -> &[WorkItem] {
        &self.work_items
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Appends a request awaiting its response.
    pub fn push(&mut self, request: Request) -> Result<(), BridgeError> {
        if self.complete {
            return Err(BridgeError::WorkItemsComplete {
                correlation_id: self.correlation_id.clone(),
            });
        }
        self.work_items.push(WorkItem {
            request,
            response: None,
        });
        Ok(())
    }

    /// Attaches the resolving response to the newest unanswered item and
    /// completes the unit. Returns false if the unit was already complete.
    pub fn resolve(&mut self, response: Response) -> bool {
        if self.complete {
            return false;
        }
        if let Some(item) = self
            .work_items
            .iter_mut()
            .rev()
            .find(|item| item.response.is_none())
        {
            item.response = Some(response);
        }
        self.complete = true;
        true
    }
}
