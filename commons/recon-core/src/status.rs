use serde::{Deserialize, Serialize};

use crate::graph::NodeId;

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum Status {
    #[default]
    Pending,
    Success,
    Failure,
    Warning,
    Deleting,
    DeleteFailed,
    Error,
    #[serde(other)]
    Unknown,
}

impl Status {
    /// Higher rank wins when rolling component statuses up.
    fn rank(self) -> u8 {
        match self {
            Status::DeleteFailed => 7,
            Status::Failure => 6,
            Status::Error => 5,
            Status::Deleting => 4,
            Status::Pending => 3,
            Status::Unknown => 2,
            Status::Warning => 1,
            Status::Success => 0,
        }
    }

    pub fn is_terminal_failure(self) -> bool {
        matches!(self, Status::Failure | Status::DeleteFailed)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ComponentStatus {
    pub name: String,
    pub status: Status,
    /// Short human-readable summary.
    #[serde(default)]
    pub message: String,
    /// Raw underlying detail, usually an error string.
    #[serde(default)]
    pub detail: String,
}

impl ComponentStatus {
    pub fn new(
        name: impl Into<String>,
        status: Status,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            detail: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// Observed state of a resource: an overall status plus named components.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub status: Status,
    #[serde(default)]
    pub components: Vec<ComponentStatus>,
    #[serde(default)]
    pub observed_generation: Option<u64>,
    /// Objects this resource created elsewhere, in creation order. Kept so
    /// that children dropped from the spec can still be found and removed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inventory: Vec<NodeId>,
}

impl ResourceStatus {
    /// Insert or replace the component with the same name. Order of first
    /// insertion is kept so dashboards don't reshuffle.
    pub fn upsert_component(&mut self, component: ComponentStatus) {
        match self
            .components
            .iter_mut()
            .find(|c| c.name == component.name)
        {
            Some(existing) => *existing = component,
            None => self.components.push(component),
        }
    }

    pub fn set_component(
        &mut self,
        name: &str,
        status: Status,
        message: impl Into<String>,
    ) {
        self.upsert_component(ComponentStatus::new(name, status, message));
    }

    pub fn component(&self, name: &str) -> Option<&ComponentStatus> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn remove_component(&mut self, name: &str) -> Option<ComponentStatus> {
        let idx = self.components.iter().position(|c| c.name == name)?;
        Some(self.components.remove(idx))
    }

    /// Add ids not yet recorded, keeping existing order.
    pub fn extend_inventory<'a>(
        &mut self,
        ids: impl IntoIterator<Item = &'a NodeId>,
    ) {
        for id in ids {
            if !self.inventory.contains(id) {
                self.inventory.push(id.clone());
            }
        }
    }

    /// Worst component status, or `None` when there are no components.
    pub fn roll_up(&self) -> Option<Status> {
        self.components
            .iter()
            .map(|c| c.status)
            .max_by_key(|s| s.rank())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_replaces_by_name() {
        let mut st = ResourceStatus::default();
        st.set_component("a", Status::Pending, "waiting");
        st.set_component("b", Status::Success, "ok");
        st.set_component("a", Status::Success, "done");
        assert_eq!(st.components.len(), 2);
        assert_eq!(st.components[0].name, "a");
        assert_eq!(st.component("a").unwrap().status, Status::Success);
        assert_eq!(st.component("a").unwrap().message, "done");
    }

    #[test]
    fn inventory_keeps_first_seen_order() {
        let a = NodeId::new("v1", "ConfigMap", "ns", "a");
        let b = NodeId::new("v1", "ConfigMap", "ns", "b");
        let mut st = ResourceStatus::default();
        st.extend_inventory([&b, &a]);
        st.extend_inventory([&a, &b]);
        assert_eq!(st.inventory, vec![b, a]);
    }

    #[test]
    fn empty_inventory_is_not_serialized() {
        let v = serde_json::to_value(ResourceStatus::default()).unwrap();
        assert!(v.get("inventory").is_none());
    }

    #[test]
    fn roll_up_picks_worst() {
        let mut st = ResourceStatus::default();
        assert_eq!(st.roll_up(), None);
        st.set_component("a", Status::Success, "");
        assert_eq!(st.roll_up(), Some(Status::Success));
        st.set_component("b", Status::Warning, "");
        assert_eq!(st.roll_up(), Some(Status::Warning));
        st.set_component("c", Status::Pending, "");
        assert_eq!(st.roll_up(), Some(Status::Pending));
        st.set_component("d", Status::Error, "");
        assert_eq!(st.roll_up(), Some(Status::Error));
        st.set_component("e", Status::Failure, "");
        assert_eq!(st.roll_up(), Some(Status::Failure));
        st.remove_component("e");
        assert_eq!(st.roll_up(), Some(Status::Error));
    }

    #[test]
    fn unknown_status_strings_deserialize_as_unknown() {
        let s: Status = serde_json::from_str("\"Exploded\"").unwrap();
        assert_eq!(s, Status::Unknown);
        let s: Status = serde_json::from_str("\"DeleteFailed\"").unwrap();
        assert_eq!(s, Status::DeleteFailed);
    }
}
