//! Blocking JSON-RPC client for the monitoring server's management API.
//!
//! Mechanical adapter from [`MonitorApi`] operations to the server's
//! JSON-RPC method catalogue. All policy (retry, chunking, degradation)
//! lives in the driver; this layer only shapes requests and responses.

use super::{ApiResult, HistoryRecord, HostRef, HostStatus, ItemRef, MonitorApi, ValueType};
use crate::config::AgentAddr;
use crate::error::ApiError;
use chrono::NaiveDateTime;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

const MONITORED: &str = "0";
const UNMONITORED: &str = "1";
const ENABLED_ITEM: &str = "0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct RpcClient {
    http: reqwest::blocking::Client,
    endpoint: String,
    user: String,
    password: String,
    auth: Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(endpoint: &str, user: &str, password: &str) -> ApiResult<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            user: user.to_string(),
            password: password.to_string(),
            auth: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    fn call(&self, method: &str, params: Value) -> ApiResult<Value> {
        let auth = self
            .auth
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "auth": auth,
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        });

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(|err| {
                if err.is_timeout() {
                    ApiError::Timeout(format!("{method}: {err}"))
                } else {
                    ApiError::Transport(format!("{method}: {err}"))
                }
            })?;

        let envelope: Value = response
            .json()
            .map_err(|err| ApiError::Transport(format!("{method}: malformed response: {err}")))?;

        if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
            let detail = error
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default();
            return if method == "user.login" {
                Err(ApiError::Auth(format!("{method}: {detail}")))
            } else {
                Err(ApiError::Rejected(format!("{method}: {detail}")))
            };
        }
        envelope
            .get("result")
            .cloned()
            .ok_or_else(|| ApiError::Transport(format!("{method}: response without result")))
    }

    fn result_rows(&self, method: &str, params: Value) -> ApiResult<Vec<Value>> {
        match self.call(method, params)? {
            Value::Array(rows) => Ok(rows),
            other => Err(ApiError::Transport(format!(
                "{method}: expected array result, got {other}"
            ))),
        }
    }

    fn get_group_id(&self, name: &str) -> ApiResult<u64> {
        let groups = self.result_rows(
            "hostgroup.get",
            json!({ "filter": { "name": name } }),
        )?;
        groups
            .first()
            .and_then(|g| id_field(g, "groupid"))
            .ok_or_else(|| ApiError::Rejected(format!("host group {name:?} not found")))
    }

    fn get_template_id(&self, name: &str) -> ApiResult<u64> {
        let templates = self.result_rows(
            "template.get",
            json!({ "filter": { "host": name } }),
        )?;
        templates
            .first()
            .and_then(|t| id_field(t, "templateid"))
            .ok_or_else(|| ApiError::Rejected(format!("template {name:?} not found")))
    }

    fn get_host_ids(&self, hostnames: &[String]) -> ApiResult<Vec<u64>> {
        let hosts = self.result_rows(
            "host.get",
            json!({ "filter": { "host": hostnames }, "output": ["hostid"] }),
        )?;
        Ok(hosts.iter().filter_map(|h| id_field(h, "hostid")).collect())
    }

    fn set_host_statuses(&self, hostnames: &[String], status: &str) -> ApiResult<()> {
        let ids: Vec<Value> = self
            .get_host_ids(hostnames)?
            .into_iter()
            .map(|id| json!({ "hostid": id.to_string() }))
            .collect();
        self.call(
            "host.massupdate",
            json!({ "hosts": ids, "status": status }),
        )?;
        Ok(())
    }

    fn history_query(&self, params: Value) -> ApiResult<Vec<HistoryRecord>> {
        let rows = self.result_rows("history.get", params)?;
        Ok(rows
            .iter()
            .map(|row| HistoryRecord {
                item_id: id_field(row, "itemid").unwrap_or(0),
                clock: row
                    .get("clock")
                    .and_then(int_value)
                    .unwrap_or(0),
                value: row
                    .get("value")
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default(),
            })
            .collect())
    }
}

impl MonitorApi for RpcClient {
    fn login(&self) -> ApiResult<()> {
        let result = self.call(
            "user.login",
            json!({ "user": self.user, "password": self.password }),
        )?;
        let token = result
            .as_str()
            .ok_or_else(|| ApiError::Auth("login returned no token".to_string()))?;
        *self.auth.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.to_string());
        Ok(())
    }

    fn is_logged_in(&self) -> bool {
        self.auth
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn api_version(&self) -> ApiResult<String> {
        let result = self.call("apiinfo.version", json!({}))?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ApiError::Transport("apiinfo.version: non-string result".to_string()))
    }

    fn create_host(
        &self,
        name: &str,
        group: &str,
        template: &str,
        agent: &AgentAddr,
        status: HostStatus,
    ) -> ApiResult<()> {
        let group_id = self.get_group_id(group)?;
        let template_id = self.get_template_id(template)?;
        self.call(
            "host.create",
            json!({
                "host": name,
                "groups": [ { "groupid": group_id.to_string() } ],
                "templates": [ { "templateid": template_id.to_string() } ],
                "status": status_code(status),
                "interfaces": [
                    {
                        "type": 1,
                        "main": 1,
                        "useip": 1,
                        "ip": agent.ip_address,
                        "dns": "",
                        "port": agent.port.to_string(),
                    }
                ],
            }),
        )?;
        Ok(())
    }

    fn delete_host(&self, host_id: u64) -> ApiResult<()> {
        self.call(
            "host.delete",
            json!([ { "hostid": host_id.to_string() } ]),
        )?;
        Ok(())
    }

    fn enable_hosts(&self, hostnames: &[String]) -> ApiResult<()> {
        self.set_host_statuses(hostnames, MONITORED)
    }

    fn disable_hosts(&self, hostnames: &[String]) -> ApiResult<()> {
        self.set_host_statuses(hostnames, UNMONITORED)
    }

    fn get_host_id(&self, hostname: &str) -> ApiResult<Option<u64>> {
        let hosts = self.result_rows(
            "host.get",
            json!({ "filter": { "host": hostname } }),
        )?;
        Ok(hosts.first().and_then(|h| id_field(h, "hostid")))
    }

    fn get_enabled_hosts(&self) -> ApiResult<Vec<HostRef>> {
        let hosts = self.result_rows(
            "host.get",
            json!({
                "filter": { "status": MONITORED },
                "output": ["hostid", "host"],
            }),
        )?;
        Ok(hosts.iter().filter_map(host_ref).collect())
    }

    fn get_registered_test_hosts(&self, group: &str) -> ApiResult<Vec<HostRef>> {
        let group_id = self.get_group_id(group)?;
        let hosts = self.result_rows(
            "host.get",
            json!({
                "groupids": [group_id.to_string()],
                "output": ["hostid", "host"],
            }),
        )?;
        Ok(hosts
            .iter()
            .filter_map(host_ref)
            .filter(|host| is_test_hostname(&host.name))
            .collect())
    }

    fn get_items(&self, hostname: &str) -> ApiResult<Vec<ItemRef>> {
        let items = self.result_rows(
            "item.get",
            json!({
                "host": hostname,
                "output": ["itemid", "value_type"],
            }),
        )?;
        Ok(items.iter().filter_map(item_ref).collect())
    }

    fn get_enabled_items(&self, host_ids: &[u64]) -> ApiResult<Vec<ItemRef>> {
        let ids: Vec<String> = host_ids.iter().map(u64::to_string).collect();
        let items = self.result_rows(
            "item.get",
            json!({
                "hostids": ids,
                "filter": { "status": ENABLED_ITEM },
                "output": ["itemid", "value_type"],
            }),
        )?;
        Ok(items.iter().filter_map(item_ref).collect())
    }

    fn get_items_range(&self, hostnames: &[String]) -> ApiResult<(u64, u64)> {
        let host_ids: Vec<String> = self
            .get_host_ids(hostnames)?
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        let items = self.result_rows(
            "item.get",
            json!({ "hostids": host_ids, "output": ["itemid"] }),
        )?;
        let ids: Vec<u64> = items.iter().filter_map(|i| id_field(i, "itemid")).collect();
        match (ids.iter().min(), ids.iter().max()) {
            (Some(&min), Some(&max)) => Ok((min, max)),
            _ => Err(ApiError::Rejected("no items for given hosts".to_string())),
        }
    }

    fn get_history(
        &self,
        item: &ItemRef,
        begin: NaiveDateTime,
        end: NaiveDateTime,
    ) -> ApiResult<Vec<HistoryRecord>> {
        self.history_query(json!({
            "history": item.value_type.code(),
            "itemids": [item.id.to_string()],
            "time_from": begin.and_utc().timestamp(),
            "time_till": end.and_utc().timestamp(),
            "output": "extend",
        }))
    }

    fn get_history_by_host(
        &self,
        host_id: u64,
        value_type: ValueType,
        begin: NaiveDateTime,
        end: NaiveDateTime,
    ) -> ApiResult<Vec<HistoryRecord>> {
        self.history_query(json!({
            "history": value_type.code(),
            "hostids": [host_id.to_string()],
            "time_from": begin.and_utc().timestamp(),
            "time_till": end.and_utc().timestamp(),
            "output": "extend",
        }))
    }

    fn get_history_by_key(
        &self,
        hostname: &str,
        key: &str,
        begin: NaiveDateTime,
        end: NaiveDateTime,
    ) -> ApiResult<Vec<HistoryRecord>> {
        let items = self.result_rows(
            "item.get",
            json!({
                "host": hostname,
                "filter": { "key_": key },
                "output": ["itemid", "value_type"],
            }),
        )?;
        match items.first().and_then(item_ref) {
            Some(item) => self.get_history(&item, begin, end),
            None => Ok(Vec::new()),
        }
    }
}

fn status_code(status: HostStatus) -> &'static str {
    match status {
        HostStatus::Monitored => MONITORED,
        HostStatus::Unmonitored => UNMONITORED,
    }
}

/// Ids arrive either as JSON strings or numbers depending on server version.
fn id_field(value: &Value, key: &str) -> Option<u64> {
    value.get(key).and_then(|v| match v {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    })
}

fn int_value(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn host_ref(value: &Value) -> Option<HostRef> {
    Some(HostRef {
        id: id_field(value, "hostid")?,
        name: value.get("host")?.as_str()?.to_string(),
    })
}

fn item_ref(value: &Value) -> Option<ItemRef> {
    let code = value.get("value_type").and_then(int_value)? as u8;
    Some(ItemRef {
        id: id_field(value, "itemid")?,
        value_type: ValueType::from_code(code)?,
    })
}

/// Hosts the benchmark itself registered; everything else is left alone.
pub fn is_test_hostname(name: &str) -> bool {
    name.strip_prefix("TestHost")
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn id_fields_accept_strings_and_numbers() {
        assert_eq!(id_field(&json!({ "hostid": "10084" }), "hostid"), Some(10084));
        assert_eq!(id_field(&json!({ "hostid": 10084 }), "hostid"), Some(10084));
        assert_eq!(id_field(&json!({ "hostid": true }), "hostid"), None);
    }

    #[test]
    fn test_hostnames_are_strictly_numbered() {
        assert!(is_test_hostname("TestHost0"));
        assert!(is_test_hostname("TestHost41"));
        assert!(!is_test_hostname("TestHost"));
        assert!(!is_test_hostname("TestHost1a"));
        assert!(!is_test_hostname("production-db"));
    }

    #[test]
    fn item_refs_require_known_value_types() {
        assert!(item_ref(&json!({ "itemid": "1", "value_type": "3" })).is_some());
        assert!(item_ref(&json!({ "itemid": "1", "value_type": "9" })).is_none());
    }
}
