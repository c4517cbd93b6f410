//! Combining the replies of several nodes into one.

use crate::error::{ClusterError, Result};
use crate::protocol::RespValue;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// How per-node replies of a broadcast are folded together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponsePolicy {
    /// Integers are summed, arrays concatenated, anything else keeps the
    /// first reply
    #[default]
    Default,
    /// Every node must reply the same thing (FLUSHALL, SCRIPT LOAD)
    AllSucceeded,
    /// The first reply is kept
    OneSucceeded,
    /// Numeric sum (DBSIZE, DEL)
    AggSum,
    AggMin,
    AggMax,
    /// 0/1 integers or booleans, and-ed together
    AggLogicalAnd,
    AggLogicalOr,
}

/// Fold `new` into `existing` under `policy`. A null reply on either side
/// yields the other one.
pub fn aggregate(existing: RespValue, new: RespValue, policy: ResponsePolicy) -> Result<RespValue> {
    if existing.is_null() {
        return Ok(new);
    }
    if new.is_null() {
        return Ok(existing);
    }

    match policy {
        ResponsePolicy::Default => Ok(match (existing, new) {
            (RespValue::Integer(a), RespValue::Integer(b)) => RespValue::Integer(a.wrapping_add(b)),
            (RespValue::Array(Some(mut a)), RespValue::Array(Some(b))) => {
                a.extend(b);
                RespValue::Array(Some(a))
            }
            (existing, _) => existing,
        }),
        ResponsePolicy::OneSucceeded => Ok(existing),
        ResponsePolicy::AllSucceeded => {
            if existing == new {
                Ok(existing)
            } else {
                Err(mismatch("replies differ between nodes", &existing, &new))
            }
        }
        ResponsePolicy::AggSum => match (existing, new) {
            (RespValue::Integer(a), RespValue::Integer(b)) => Ok(RespValue::Integer(a.wrapping_add(b))),
            (RespValue::Double(a), RespValue::Double(b)) => Ok(RespValue::Double(a + b)),
            (RespValue::Array(Some(mut a)), RespValue::Array(Some(b))) => {
                a.extend(b);
                Ok(RespValue::Array(Some(a)))
            }
            (a, b) => Err(mismatch("cannot sum", &a, &b)),
        },
        ResponsePolicy::AggMin | ResponsePolicy::AggMax => {
            let order = compare(&existing, &new)
                .ok_or_else(|| mismatch("cannot compare", &existing, &new))?;
            let keep_existing = match policy {
                ResponsePolicy::AggMin => order != Ordering::Greater,
                _ => order != Ordering::Less,
            };
            Ok(if keep_existing { existing } else { new })
        }
        ResponsePolicy::AggLogicalAnd | ResponsePolicy::AggLogicalOr => {
            let and = policy == ResponsePolicy::AggLogicalAnd;
            match (&existing, &new) {
                (RespValue::Boolean(a), RespValue::Boolean(b)) => {
                    Ok(RespValue::Boolean(if and { *a && *b } else { *a || *b }))
                }
                (RespValue::Integer(a), RespValue::Integer(b)) => {
                    let (a, b) = (*a != 0, *b != 0);
                    let result = if and { a && b } else { a || b };
                    Ok(RespValue::Integer(result as i64))
                }
                _ => Err(mismatch("not a boolean", &existing, &new)),
            }
        }
    }
}

/// Fold a whole list of replies. `None` when the list is empty.
pub fn aggregate_all<I>(replies: I, policy: ResponsePolicy) -> Result<Option<RespValue>>
where
    I: IntoIterator<Item = RespValue>,
{
    let mut acc: Option<RespValue> = None;
    for reply in replies {
        acc = Some(match acc {
            None => reply,
            Some(existing) => aggregate(existing, reply, policy)?,
        });
    }
    Ok(acc)
}

fn compare(a: &RespValue, b: &RespValue) -> Option<Ordering> {
    match (a, b) {
        (RespValue::Integer(a), RespValue::Integer(b)) => Some(a.cmp(b)),
        (RespValue::Double(a), RespValue::Double(b)) => a.partial_cmp(b),
        (RespValue::BulkString(Some(a)), RespValue::BulkString(Some(b))) => Some(a.cmp(b)),
        (RespValue::SimpleString(a), RespValue::SimpleString(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn mismatch(what: &str, a: &RespValue, b: &RespValue) -> ClusterError {
    ClusterError::AggregationMismatch(format!("{}: {:?} vs {:?}", what, a, b))
}
