use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Attribute names the server itself interprets.
pub mod names {
    pub const JOB_OWNER: &str = "Job_Owner";
    pub const JOB_NAME: &str = "Job_Name";
    pub const HOLD_TYPES: &str = "Hold_Types";
    pub const EXECUTION_TIME: &str = "Execution_Time";
    pub const MAIL_USERS: &str = "Mail_Users";
    pub const RESOURCE_LIST: &str = "Resource_List";
    pub const EXEC_HOST: &str = "exec_host";
    pub const SESSION_ID: &str = "session_id";
    pub const EXIT_STATUS: &str = "exit_status";
    pub const ARRAY_REQUEST: &str = "job_array_request";
    pub const ARRAY_ID: &str = "job_array_id";
    pub const COMMENT: &str = "comment";
}

/// One attribute as it travels on the wire: name, optional resource and a
/// string-encoded value. Typed decoding of values is left to consumers.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,
    pub value: String,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource: String::new(),
            value: value.into(),
        }
    }

    pub fn resource(
        name: impl Into<String>,
        resource: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            resource: resource.into(),
            value: value.into(),
        }
    }
}

/// Attributes an execution host is allowed to see. Everything else (routing
/// state, mail settings, dependency and array bookkeeping) stays on the
/// server when a job is dispatched for execution.
const MOM_VISIBLE: &[&str] = &[
    "Account_Name",
    "Checkpoint",
    "Error_Path",
    "Job_Name",
    "Job_Owner",
    "Join_Path",
    "Keep_Files",
    "Output_Path",
    "Priority",
    "Resource_List",
    "Shell_Path_List",
    "Variable_List",
    "egroup",
    "euser",
    "exec_host",
    "interactive",
    "job_array_id",
];

pub fn mom_visible(name: &str) -> bool {
    MOM_VISIBLE.contains(&name)
}

/// The open attribute mapping carried by every job, keyed by
/// (name, resource).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AttributeMap {
    entries: BTreeMap<(String, String), String>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_resource(name, "")
    }

    pub fn get_resource(&self, name: &str, resource: &str) -> Option<&str> {
        self.entries
            .get(&(name.to_owned(), resource.to_owned()))
            .map(String::as_str)
    }

    /// Sets a value, returning true when it actually changed.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> bool {
        self.set_resource(name, "", value)
    }

    pub fn set_resource(
        &mut self,
        name: &str,
        resource: &str,
        value: impl Into<String>,
    ) -> bool {
        let value = value.into();
        let key = (name.to_owned(), resource.to_owned());
        if self.entries.get(&key) == Some(&value) {
            return false;
        }
        self.entries.insert(key, value);
        true
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _), _| n != name);
        before != self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Attribute> + '_ {
        self.entries
            .iter()
            .map(|((name, resource), value)| Attribute {
                name: name.clone(),
                resource: resource.clone(),
                value: value.clone(),
            })
    }

    pub fn to_wire(&self) -> Vec<Attribute> {
        self.iter().collect()
    }

    /// Only the attributes an execution host may see.
    pub fn to_wire_for_mom(&self) -> Vec<Attribute> {
        self.iter().filter(|a| mom_visible(&a.name)).collect()
    }

    /// Applies a list of attributes, returning true if anything changed.
    pub fn apply(&mut self, attrs: &[Attribute]) -> bool {
        let mut changed = false;
        for a in attrs {
            changed |= self.set_resource(&a.name, &a.resource, a.value.clone());
        }
        changed
    }
}

impl FromIterator<Attribute> for AttributeMap {
    fn from_iter<I: IntoIterator<Item = Attribute>>(iter: I) -> Self {
        let mut map = Self::new();
        for a in iter {
            map.set_resource(&a.name, &a.resource, a.value);
        }
        map
    }
}

impl Serialize for AttributeMap {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for AttributeMap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Vec::<Attribute>::deserialize(deserializer)?
            .into_iter()
            .collect())
    }
}
