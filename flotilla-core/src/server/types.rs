//! HTTP request/response bodies

use serde::{Deserialize, Serialize};

use crate::manager::state::ShardId;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub host: String,
    pub port: u16,
    pub version: u64,
}

#[derive(Debug, Deserialize)]
pub struct AddressParams {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize)]
pub struct Ack {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct AssignmentEntry {
    pub shard: ShardId,
    pub owner: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AssignmentsResponse {
    pub version: u64,
    pub assignments: Vec<AssignmentEntry>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
}
