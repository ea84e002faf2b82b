use crate::frame::frame_errors::ParseError;
use crate::frame::types;
use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub enum Event {
    TopologyChange(TopologyChangeEvent),
    StatusChange(StatusChangeEvent),
    SchemaChange(SchemaChangeEvent),
}

#[derive(Debug, Clone)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
}

#[derive(Debug, Clone)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

#[derive(Debug, Clone)]
pub enum SchemaChangeEvent {
    KeyspaceChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
    },
    TableChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        object_name: String,
    },
    TypeChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        type_name: String,
    },
    FunctionChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        function_name: String,
        arguments: Vec<String>,
    },
    AggregateChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        aggregate_name: String,
        arguments: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
    Invalid,
}

impl Event {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let event_type = types::read_string(buf)?.to_owned();
        match event_type.as_str() {
            "TOPOLOGY_CHANGE" => Ok(Self::TopologyChange(TopologyChangeEvent::deserialize(buf)?)),
            "STATUS_CHANGE" => Ok(Self::StatusChange(StatusChangeEvent::deserialize(buf)?)),
            "SCHEMA_CHANGE" => Ok(Self::SchemaChange(SchemaChangeEvent::deserialize(buf)?)),
            _ => Err(ParseError::BadIncomingData(format!(
                "Invalid event type: {}",
                event_type
            ))),
        }
    }
}

impl TopologyChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change = types::read_string(buf)?.to_owned();
        let addr = types::read_inet(buf)?;

        match type_of_change.as_str() {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            _ => Err(ParseError::BadIncomingData(format!(
                "Invalid topology change type: {}",
                type_of_change
            ))),
        }
    }
}

impl StatusChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_status = types::read_string(buf)?.to_owned();
        let addr = types::read_inet(buf)?;

        match type_of_status.as_str() {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(ParseError::BadIncomingData(format!(
                "Invalid status change type: {}",
                type_of_status
            ))),
        }
    }
}

impl SchemaChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change_string = types::read_string(buf)?;
        let type_of_change = match type_of_change_string {
            "CREATED" => SchemaChangeType::Created,
            "UPDATED" => SchemaChangeType::Updated,
            "DROPPED" => SchemaChangeType::Dropped,
            _ => SchemaChangeType::Invalid,
        };

        let target = types::read_string(buf)?.to_owned();
        let keyspace_affected = types::read_string(buf)?.to_owned();

        match target.as_str() {
            "KEYSPACE" => Ok(Self::KeyspaceChange {
                change_type: type_of_change,
                keyspace_name: keyspace_affected,
            }),
            "TABLE" => {
                let table_name = types::read_string(buf)?.to_owned();
                Ok(Self::TableChange {
                    change_type: type_of_change,
                    keyspace_name: keyspace_affected,
                    object_name: table_name,
                })
            }
            "TYPE" => {
                let type_name = types::read_string(buf)?.to_owned();
                Ok(Self::TypeChange {
                    change_type: type_of_change,
                    keyspace_name: keyspace_affected,
                    type_name,
                })
            }
            "FUNCTION" => {
                let function_name = types::read_string(buf)?.to_owned();
                let arguments = types::read_string_list(buf)?;
                Ok(Self::FunctionChange {
                    change_type: type_of_change,
                    keyspace_name: keyspace_affected,
                    function_name,
                    arguments,
                })
            }
            "AGGREGATE" => {
                let aggregate_name = types::read_string(buf)?.to_owned();
                let arguments = types::read_string_list(buf)?;
                Ok(Self::AggregateChange {
                    change_type: type_of_change,
                    keyspace_name: keyspace_affected,
                    aggregate_name,
                    arguments,
                })
            }
            _ => Err(ParseError::BadIncomingData(format!(
                "Invalid schema change target: {}",
                target
            ))),
        }
    }
}
