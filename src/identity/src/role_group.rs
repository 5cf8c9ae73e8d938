use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IdentityResult;
use crate::store::RecordStore;

/// A named group of roles (table `role_group`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleGroup {
    #[serde(default)]
    pub id: String,
    pub name: String,
}

/// Read access to role groups.
pub struct RoleGroupDao {
    store: Arc<dyn RecordStore>,
    keyspace: String,
    table: String,
}

impl RoleGroupDao {
    pub fn new(store: Arc<dyn RecordStore>, keyspace: &str, table: &str) -> Self {
        Self {
            store,
            keyspace: keyspace.to_string(),
            table: table.to_string(),
        }
    }

    pub async fn list_role_groups(&self) -> IdentityResult<Vec<RoleGroup>> {
        let rows = self.store.get_all(&self.keyspace, &self.table).await?;
        log::debug!("Loaded {} role groups", rows.len());
        rows.into_iter()
            .map(|row| Ok(serde_json::from_value(Value::Object(row))?))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IdentityError;
    use crate::store::MockRecordStore;
    use cluster::row;
    use mockall::predicate::eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_list_role_groups() {
        let mut store = MockRecordStore::new();
        store
            .expect_get_all()
            .with(eq("identity"), eq("role_group"))
            .returning(|_, _| {
                Ok(vec![
                    row([("name", json!("Flag Reviewer"))]),
                    row([
                        ("id", json!("g2")),
                        ("name", json!("Content Creation")),
                        ("urlActionIds", json!(["a1"])),
                    ]),
                ])
            });

        let dao = RoleGroupDao::new(Arc::new(store), "identity", "role_group");
        let groups = dao.list_role_groups().await.unwrap();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "Flag Reviewer");
        assert_eq!(groups[0].id, "");
        assert_eq!(groups[1].id, "g2");
    }

    #[tokio::test]
    async fn test_malformed_role_group_is_a_server_error() {
        let mut store = MockRecordStore::new();
        store
            .expect_get_all()
            .returning(|_, _| Ok(vec![row([("id", json!("g1"))])]));

        let dao = RoleGroupDao::new(Arc::new(store), "identity", "role_group");
        assert!(matches!(
            dao.list_role_groups().await,
            Err(IdentityError::Server(_))
        ));
    }
}
