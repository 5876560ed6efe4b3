//! MCP tool definitions
//!
//! Every tool is a [`ToolDescriptor`] in a static table. A descriptor carries
//! the ordered parameter schema used both to render `inputSchema` for
//! `tools/list` and to validate arguments before any handler runs.

use crate::broker::Query;
use crate::error::ValidationError;
use crate::mcp::types::McpToolDefinition;
use serde_json::{json, Map, Value};

/// JSON type of a tool parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// JSON string
    String,
    /// JSON integer
    Integer,
    /// JSON boolean
    Boolean,
}

impl ParamType {
    /// JSON Schema type name
    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
        }
    }
}

/// Default applied when an optional parameter is absent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Literal {
    /// Integer default
    Int(i64),
    /// Boolean default
    Bool(bool),
    /// String default
    Str(&'static str),
}

impl Literal {
    fn to_value(self) -> Value {
        match self {
            Literal::Int(i) => json!(i),
            Literal::Bool(b) => json!(b),
            Literal::Str(s) => json!(s),
        }
    }
}

/// Extra restriction on a parameter's value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// Any value of the declared type
    None,
    /// Inclusive integer bounds
    Range(i64, i64),
    /// Integer drawn from a fixed set
    Levels(&'static [i64]),
    /// String drawn from a fixed set
    OneOf(&'static [&'static str]),
}

/// Declaration of one tool parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    /// Field name
    pub name: &'static str,
    /// JSON type
    pub kind: ParamType,
    /// Whether the caller must supply it
    pub required: bool,
    /// Value restriction
    pub constraint: Constraint,
    /// Default for absent optional fields
    pub default: Option<Literal>,
    /// Human description
    pub description: &'static str,
}

impl ParamSpec {
    const fn new(name: &'static str, kind: ParamType, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            constraint: Constraint::None,
            default: None,
            description,
        }
    }

    /// Optional string parameter
    pub const fn string(name: &'static str, description: &'static str) -> Self {
        Self::new(name, ParamType::String, description)
    }

    /// Optional integer parameter
    pub const fn integer(name: &'static str, description: &'static str) -> Self {
        Self::new(name, ParamType::Integer, description)
    }

    /// Optional boolean parameter
    pub const fn boolean(name: &'static str, description: &'static str) -> Self {
        Self::new(name, ParamType::Boolean, description)
    }

    /// Mark as required
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Restrict the value
    pub const fn constrained(mut self, constraint: Constraint) -> Self {
        self.constraint = constraint;
        self
    }

    /// Set the default
    pub const fn default_to(mut self, value: Literal) -> Self {
        self.default = Some(value);
        self
    }

    fn schema(&self) -> Value {
        let mut schema = Map::new();
        schema.insert("type".into(), json!(self.kind.as_str()));
        schema.insert("description".into(), json!(self.description));
        match self.constraint {
            Constraint::None => {}
            Constraint::Range(min, max) => {
                schema.insert("minimum".into(), json!(min));
                schema.insert("maximum".into(), json!(max));
            }
            Constraint::Levels(levels) => {
                schema.insert("enum".into(), json!(levels));
            }
            Constraint::OneOf(values) => {
                schema.insert("enum".into(), json!(values));
            }
        }
        if let Some(default) = self.default {
            schema.insert("default".into(), default.to_value());
        }
        Value::Object(schema)
    }

    fn check(&self, value: &Value) -> Result<Value, ValidationError> {
        let wrong_type = || ValidationError::WrongType {
            field: self.name.to_string(),
            expected: self.kind.as_str(),
        };

        match self.kind {
            ParamType::String => {
                let s = value.as_str().ok_or_else(wrong_type)?;
                if self.required && s.is_empty() {
                    return Err(ValidationError::MissingField(self.name.to_string()));
                }
                if let Constraint::OneOf(allowed) = self.constraint {
                    if !allowed.contains(&s) {
                        return Err(ValidationError::NotInEnum {
                            field: self.name.to_string(),
                            value: s.to_string(),
                            allowed: allowed.join(", "),
                        });
                    }
                }
            }
            ParamType::Integer => {
                let i = value.as_i64().ok_or_else(wrong_type)?;
                match self.constraint {
                    Constraint::Range(min, max) if i < min || i > max => {
                        return Err(ValidationError::OutOfRange {
                            field: self.name.to_string(),
                            value: i,
                            min,
                            max,
                        });
                    }
                    Constraint::Levels(levels) if !levels.contains(&i) => {
                        return Err(ValidationError::NotInEnum {
                            field: self.name.to_string(),
                            value: i.to_string(),
                            allowed: levels
                                .iter()
                                .map(i64::to_string)
                                .collect::<Vec<_>>()
                                .join(", "),
                        });
                    }
                    _ => {}
                }
            }
            ParamType::Boolean => {
                value.as_bool().ok_or_else(wrong_type)?;
            }
        }
        Ok(value.clone())
    }
}

/// Static description of one tool
#[derive(Debug)]
pub struct ToolDescriptor {
    /// Unique tool name
    pub name: &'static str,
    /// Description shown to the model
    pub description: &'static str,
    /// Ordered parameter schema
    pub params: &'static [ParamSpec],
    /// What a successful call returns
    pub result: &'static str,
}

impl ToolDescriptor {
    /// JSON Schema for the tool's arguments
    pub fn input_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .params
            .iter()
            .map(|p| (p.name.to_string(), p.schema()))
            .collect();
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name)
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Definition advertised by `tools/list`
    pub fn definition(&self) -> McpToolDefinition {
        McpToolDefinition {
            name: self.name.to_string(),
            description: format!("{} Returns {}.", self.description, self.result),
            input_schema: self.input_schema(),
        }
    }

    /// Check `args` against the schema
    ///
    /// `null` counts as an empty object. Defaults are filled in and fields
    /// not declared by the tool are dropped.
    pub fn validate(&self, args: &Value) -> Result<Params, ValidationError> {
        let empty = Map::new();
        let object = match args {
            Value::Null => &empty,
            Value::Object(map) => map,
            _ => return Err(ValidationError::NotAnObject),
        };

        let mut fields = Vec::with_capacity(self.params.len());
        for spec in self.params {
            match object.get(spec.name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        return Err(ValidationError::MissingField(spec.name.to_string()));
                    }
                    if let Some(default) = spec.default {
                        fields.push((spec.name, default.to_value()));
                    }
                }
                Some(value) => fields.push((spec.name, spec.check(value)?)),
            }
        }
        Ok(Params { fields })
    }
}

/// Validated tool arguments, in declaration order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    fields: Vec<(&'static str, Value)>,
}

impl Params {
    /// Raw value of a field
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, value)| value)
    }

    /// Whether a field is present
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Required string field
    pub fn str(&self, name: &str) -> Result<&str, ValidationError> {
        self.get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| ValidationError::MissingField(name.to_string()))
    }

    /// Required integer field
    pub fn int(&self, name: &str) -> Result<i64, ValidationError> {
        self.get(name)
            .and_then(Value::as_i64)
            .ok_or_else(|| ValidationError::MissingField(name.to_string()))
    }

    /// Required boolean field
    pub fn bool(&self, name: &str) -> Result<bool, ValidationError> {
        self.get(name)
            .and_then(Value::as_bool)
            .ok_or_else(|| ValidationError::MissingField(name.to_string()))
    }

    /// Every present field as an HTTP query pair
    pub fn to_query(&self) -> Query {
        self.fields
            .iter()
            .map(|(name, value)| {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (name.to_string(), text)
            })
            .collect()
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether no field is present
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

const QOS_LEVELS: &[i64] = &[0, 1, 2];

const PAGE: ParamSpec = ParamSpec::integer("page", "Page number (1-based)")
    .constrained(Constraint::Range(1, i64::MAX))
    .default_to(Literal::Int(1));

const LIMIT: ParamSpec = ParamSpec::integer("limit", "Results per page")
    .constrained(Constraint::Range(1, 10_000))
    .default_to(Literal::Int(100));

const CLIENT_ID: ParamSpec =
    ParamSpec::string("clientid", "Client identifier").required();

/// `publish_mqtt_message`
pub static PUBLISH_MQTT_MESSAGE: ToolDescriptor = ToolDescriptor {
    name: "publish_mqtt_message",
    description: "Publish an MQTT message to a topic on the EMQX broker.",
    params: &[
        ParamSpec::string("topic", "Topic to publish to; wildcards are not allowed").required(),
        ParamSpec::string("payload", "Message payload").required(),
        ParamSpec::integer("qos", "Quality of service level (0, 1 or 2)")
            .constrained(Constraint::Levels(QOS_LEVELS))
            .default_to(Literal::Int(0)),
        ParamSpec::boolean("retain", "Whether the broker should retain the message")
            .default_to(Literal::Bool(false)),
        ParamSpec::string(
            "transport",
            "Publish through the management API (http) or the bridge's own MQTT connection (mqtt)",
        )
        .constrained(Constraint::OneOf(&["http", "mqtt"]))
        .default_to(Literal::Str("http")),
    ],
    result: "the broker's publish acknowledgement",
};

/// `list_mqtt_clients`
pub static LIST_MQTT_CLIENTS: ToolDescriptor = ToolDescriptor {
    name: "list_mqtt_clients",
    description: "List MQTT clients connected to the EMQX cluster, with optional filters.",
    params: &[
        PAGE,
        LIMIT,
        ParamSpec::string("node", "Only clients on this node"),
        ParamSpec::string("clientid", "Exact client id"),
        ParamSpec::string("username", "Exact username"),
        ParamSpec::string("ip_address", "Exact client IP address"),
        ParamSpec::string("conn_state", "Connection state")
            .constrained(Constraint::OneOf(&["connected", "idle", "disconnected"])),
        ParamSpec::boolean("clean_start", "Clean start flag"),
        ParamSpec::string("proto_ver", "Protocol version"),
        ParamSpec::string("like_clientid", "Fuzzy match on client id"),
        ParamSpec::string("like_username", "Fuzzy match on username"),
        ParamSpec::string("like_ip_address", "Fuzzy match on IP address"),
    ],
    result: "a page of clients with pagination metadata",
};

/// `get_mqtt_client`
pub static GET_MQTT_CLIENT: ToolDescriptor = ToolDescriptor {
    name: "get_mqtt_client",
    description: "Get detailed information about one MQTT client.",
    params: &[CLIENT_ID],
    result: "the client's connection and session details",
};

/// `kick_mqtt_client`
pub static KICK_MQTT_CLIENT: ToolDescriptor = ToolDescriptor {
    name: "kick_mqtt_client",
    description: "Disconnect an MQTT client from the broker.",
    params: &[CLIENT_ID],
    result: "a success flag and message",
};

/// `list_mqtt_subscriptions`
pub static LIST_MQTT_SUBSCRIPTIONS: ToolDescriptor = ToolDescriptor {
    name: "list_mqtt_subscriptions",
    description: "List topic subscriptions held by clients on the broker.",
    params: &[
        PAGE,
        LIMIT,
        ParamSpec::string("clientid", "Only subscriptions of this client"),
        ParamSpec::string("topic", "Exact topic filter"),
        ParamSpec::integer("qos", "Only subscriptions with this QoS")
            .constrained(Constraint::Levels(QOS_LEVELS)),
        ParamSpec::string("match_topic", "Filters matching this topic name"),
        ParamSpec::string("node", "Only subscriptions on this node"),
    ],
    result: "a page of subscriptions with pagination metadata",
};

/// `list_mqtt_topics`
pub static LIST_MQTT_TOPICS: ToolDescriptor = ToolDescriptor {
    name: "list_mqtt_topics",
    description: "List topics currently routed by the broker.",
    params: &[PAGE, LIMIT, ParamSpec::string("topic", "Topic to look up")],
    result: "a page of topic routes with pagination metadata",
};

/// `get_broker_stats`
pub static GET_BROKER_STATS: ToolDescriptor = ToolDescriptor {
    name: "get_broker_stats",
    description: "Get connection, session, topic and subscription counters.",
    params: &[ParamSpec::boolean("aggregate", "Aggregate across cluster nodes")
        .default_to(Literal::Bool(true))],
    result: "broker statistics",
};

/// `subscribe_mqtt_topic`
pub static SUBSCRIBE_MQTT_TOPIC: ToolDescriptor = ToolDescriptor {
    name: "subscribe_mqtt_topic",
    description: "Subscribe this session to a topic filter; matching messages are streamed as \
                  notifications/resources/updated.",
    params: &[
        ParamSpec::string("topic", "Topic filter; + and # wildcards are allowed").required(),
        ParamSpec::integer("qos", "Subscription QoS (0, 1 or 2)")
            .constrained(Constraint::Levels(QOS_LEVELS))
            .default_to(Literal::Int(0)),
    ],
    result: "the subscription id and resource URI",
};

/// `unsubscribe_mqtt_topic`
pub static UNSUBSCRIBE_MQTT_TOPIC: ToolDescriptor = ToolDescriptor {
    name: "unsubscribe_mqtt_topic",
    description: "Stop streaming a topic filter previously subscribed in this session.",
    params: &[ParamSpec::string("topic", "Topic filter to remove").required()],
    result: "the removed subscription",
};

/// `list_active_subscriptions`
pub static LIST_ACTIVE_SUBSCRIPTIONS: ToolDescriptor = ToolDescriptor {
    name: "list_active_subscriptions",
    description: "List the live topic subscriptions owned by this session.",
    params: &[],
    result: "the session's subscriptions",
};

/// List of all available tools (for documentation)
pub const AVAILABLE_TOOLS: &[&str] = &[
    "publish_mqtt_message",
    "list_mqtt_clients",
    "get_mqtt_client",
    "kick_mqtt_client",
    "list_mqtt_subscriptions",
    "list_mqtt_topics",
    "get_broker_stats",
    "subscribe_mqtt_topic",
    "unsubscribe_mqtt_topic",
    "list_active_subscriptions",
];
