//! Handlers for calls pushed by the CSMS.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_ocpp::v2_0_1::messages::get_variables::GetVariablesRequest;
use rust_ocpp::v2_0_1::messages::set_variables::SetVariablesRequest;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use super::variables::{StationVariables, VariableStatus};
use crate::application::transport::InboundCall;
use crate::support::ocpp_frame::error_code;

/// Answered to the CSMS as a CallError.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {description}")]
pub struct HandlerError {
    pub code: &'static str,
    pub description: String,
}

impl HandlerError {
    pub fn formation_violation(description: impl Into<String>) -> Self {
        Self {
            code: error_code::FORMATION_VIOLATION,
            description: description.into(),
        }
    }
}

#[async_trait]
pub trait InboundHandler: Send + Sync {
    fn action(&self) -> &'static str;

    async fn handle(&self, payload: Value) -> Result<Value, HandlerError>;
}

/// Routes pushed calls to handlers by action name.
#[derive(Default)]
pub struct InboundRouter {
    handlers: HashMap<&'static str, Arc<dyn InboundHandler>>,
}

impl InboundRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, handler: Arc<dyn InboundHandler>) -> Self {
        self.handlers.insert(handler.action(), handler);
        self
    }

    pub fn actions(&self) -> Vec<&'static str> {
        let mut actions: Vec<_> = self.handlers.keys().copied().collect();
        actions.sort_unstable();
        actions
    }

    pub async fn dispatch(&self, call: &InboundCall) -> Result<Value, HandlerError> {
        let Some(handler) = self.handlers.get(call.action.as_str()) else {
            warn!(message_id = %call.message_id, action = %call.action, "No handler for pushed call");
            return Err(HandlerError {
                code: error_code::NOT_IMPLEMENTED,
                description: format!("Action {} is not supported", call.action),
            });
        };

        info!(message_id = %call.message_id, action = %call.action, "Handling pushed call");
        let result = handler.handle(call.payload.clone()).await;
        if let Err(e) = &result {
            warn!(message_id = %call.message_id, action = %call.action, error = %e, "Pushed call failed");
        }
        result
    }
}

pub struct SetVariablesHandler {
    variables: Arc<StationVariables>,
}

impl SetVariablesHandler {
    pub fn new(variables: Arc<StationVariables>) -> Self {
        Self { variables }
    }
}

#[async_trait]
impl InboundHandler for SetVariablesHandler {
    fn action(&self) -> &'static str {
        "SetVariables"
    }

    async fn handle(&self, payload: Value) -> Result<Value, HandlerError> {
        let request: SetVariablesRequest = serde_json::from_value(payload)
            .map_err(|e| HandlerError::formation_violation(e.to_string()))?;

        let results: Vec<Value> = request
            .set_variable_data
            .into_iter()
            .map(|data| {
                let status = self.variables.set(
                    &data.component.name,
                    &data.variable.name,
                    &data.attribute_value,
                );
                let mut result = json!({
                    "attributeStatus": status,
                    "component": data.component,
                    "variable": data.variable,
                });
                if let Some(attribute_type) = data.attribute_type {
                    result["attributeType"] = json!(attribute_type);
                }
                result
            })
            .collect();

        Ok(json!({ "setVariableResult": results }))
    }
}

pub struct GetVariablesHandler {
    variables: Arc<StationVariables>,
}

impl GetVariablesHandler {
    pub fn new(variables: Arc<StationVariables>) -> Self {
        Self { variables }
    }
}

#[async_trait]
impl InboundHandler for GetVariablesHandler {
    fn action(&self) -> &'static str {
        "GetVariables"
    }

    async fn handle(&self, payload: Value) -> Result<Value, HandlerError> {
        let request: GetVariablesRequest = serde_json::from_value(payload)
            .map_err(|e| HandlerError::formation_violation(e.to_string()))?;

        let results: Vec<Value> = request
            .get_variable_data
            .into_iter()
            .map(|data| {
                let lookup = self.variables.get(&data.component.name, &data.variable.name);
                let mut result = json!({
                    "component": data.component,
                    "variable": data.variable,
                });
                if let Some(attribute_type) = data.attribute_type {
                    result["attributeType"] = json!(attribute_type);
                }
                match lookup {
                    Ok(value) => {
                        result["attributeStatus"] = json!(VariableStatus::Accepted);
                        result["attributeValue"] = json!(value);
                    }
                    Err(status) => result["attributeStatus"] = json!(status),
                }
                result
            })
            .collect();

        Ok(json!({ "getVariableResult": results }))
    }
}
