//! Folding a confirmed mutation into the cached value of its resource.

use serde_json::Value;

use super::task::TaskKind;

/// New cached value for a resource after the server accepted a `kind`
/// mutation carrying `payload` and answered `response`. `None` leaves the cache untouched;
/// `Some(Value::Null)` means the cached entity was deleted.
///
/// Lists are only patched when they are already cached: inserting into an
/// absent list would make a partial list look complete.
pub fn reconcile(
  current: Option<Value>,
  kind: TaskKind,
  payload: Option<&Value>,
  response: &Value,
) -> Option<Value> {
  if kind == TaskKind::Sync {
    return Some(response.clone());
  }

  let item = confirmed_item(payload, response)?;
  let current = current?;

  if let Value::Array(mut items) = current {
    match kind {
      TaskKind::Create => items.insert(0, item),
      TaskKind::Update => {
        let slot = items.iter_mut().find(|i| same_id(i, &item))?;
        *slot = item;
      }
      TaskKind::Delete => {
        let before = items.len();
        items.retain(|i| !same_id(i, &item));
        if items.len() == before {
          return None;
        }
      }
      TaskKind::Sync => return None,
    }
    return Some(Value::Array(items));
  }

  // Single entity cached under the resource key
  if !same_id(&current, &item) {
    return None;
  }
  match kind {
    TaskKind::Update => Some(item),
    TaskKind::Delete => Some(Value::Null),
    TaskKind::Create | TaskKind::Sync => None,
  }
}

/// Server copy when it returned an object, else the submitted payload.
fn confirmed_item(payload: Option<&Value>, response: &Value) -> Option<Value> {
  match response {
    Value::Object(_) => Some(response.clone()),
    _ => payload.cloned(),
  }
}

fn same_id(a: &Value, b: &Value) -> bool {
  match (a.get("id"), b.get("id")) {
    (Some(x), Some(y)) => !x.is_null() && x == y,
    _ => false,
  }
}
