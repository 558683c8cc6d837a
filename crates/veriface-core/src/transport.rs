//! Flat token record for handing a [`DecisionPackage`] to the transport
//! layer. Keys are upper-case; arrays use `PREFIX[i].KEY` plus
//! `PREFIX_COUNT`. Byte layout and signing belong to the transport.

use crate::matcher::DecisionPackage;
use crate::quantize::{self, QuantBits, QuantizeError};
use std::collections::BTreeMap;

pub type TransportRecord = BTreeMap<String, String>;

fn put(record: &mut TransportRecord, key: &str, value: impl Into<String>) {
    record.insert(key.to_string(), value.into());
}

/// Indexed array tokens: `PREFIX[i].KEY` for every item plus `PREFIX_COUNT`.
pub fn array_tokens(prefix: &str, items: &[BTreeMap<String, String>]) -> TransportRecord {
    let mut out = TransportRecord::new();
    for (i, item) in items.iter().enumerate() {
        for (k, v) in item {
            out.insert(format!("{prefix}[{i}].{k}"), v.clone());
        }
    }
    out.insert(format!("{prefix}_COUNT"), items.len().to_string());
    out
}

/// Flatten a package into string tokens. The embedding is only included
/// when the package carries one, as an 8-bit quantized hex blob.
pub fn to_transport_record(package: &DecisionPackage) -> Result<TransportRecord, QuantizeError> {
    let mut r = TransportRecord::new();
    let decision = &package.decision;

    put(&mut r, "DECISION_ID", package.decision_id.to_string());
    put(&mut r, "STATUS", decision.status.as_str());
    if let Some(reason) = decision.primary_reason {
        put(&mut r, "REASON", reason.as_str());
    }
    put(&mut r, "ACTION", decision.recommended_action.as_str());
    put(&mut r, "CONFIDENCE", format!("{:.2}", decision.confidence));
    put(&mut r, "MESSAGE", decision.message.clone());

    if let Some(m) = package.match_result {
        put(&mut r, "MATCH_SCORE", format!("{:.4}", m.score));
    }
    if let Some(l) = &package.liveness {
        put(&mut r, "LIVENESS_SCORE", format!("{:.4}", l.score));
    }
    if let Some(s) = package.secondary_score {
        put(&mut r, "SECONDARY_SCORE", format!("{s:.4}"));
    }
    if let Some(id) = &package.identity_id {
        put(&mut r, "IDENTITY_ID", id.clone());
    }
    if let Some(role) = &package.role {
        put(&mut r, "ROLE", role.clone());
    }
    put(&mut r, "DEVICE_ID", package.context.device_id.clone());
    if let Some(loc) = &package.context.location {
        put(&mut r, "LOCATION", loc.clone());
    }
    put(&mut r, "TS", package.context.timestamp.to_rfc3339());
    put(&mut r, "POLICY_VERSION", package.policy_version.to_string());

    let audit: Vec<BTreeMap<String, String>> = decision
        .audit_trail
        .iter()
        .map(|e| {
            BTreeMap::from([
                ("RULE".to_string(), e.rule_name.clone()),
                ("OUTCOME".to_string(), e.outcome.as_str().to_string()),
            ])
        })
        .collect();
    r.extend(array_tokens("AUDIT", &audit));

    if let Some(embedding) = &package.embedding {
        let q = quantize::quantize(&embedding.values, QuantBits::Eight)?;
        put(&mut r, "EMB_BITS", q.params.bits.as_u8().to_string());
        put(&mut r, "EMB_DIM", q.params.dimension.to_string());
        put(&mut r, "EMB_SCALE", q.params.scale.to_string());
        put(&mut r, "EMB_ZP", q.params.zero_point.to_string());
        put(&mut r, "EMB_CRC", format!("{:08x}", q.checksum()));
        put(&mut r, "EMB_DATA", hex::encode(q.buffer.to_le_bytes()));
    }

    Ok(r)
}

/// `key:value` pairs sorted by key, joined with `|`.
pub fn canonical_string(record: &TransportRecord) -> String {
    record
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{pre_cache, MatchContext, MatchRequest, Orchestrator, OrchestratorConfig};
    use crate::liveness::LivenessResult;
    use crate::policy::Policy;
    use crate::quantize::{dequantize, QuantParams, QuantizedBuffer};
    use crate::types::{Candidate, Embedding};
    use chrono::{TimeZone, Utc};

    fn package(include_embedding: bool) -> DecisionPackage {
        let set = pre_cache(
            vec![Candidate {
                identity_id: "emp-7".into(),
                embedding: Embedding::new(vec![0.6, 0.8, 0.0]),
                role: Some("staff".into()),
            }],
            2,
        )
        .unwrap();
        let request = MatchRequest {
            live: Embedding::new(vec![0.6, 0.8, 0.0]),
            liveness: Some(LivenessResult::from_score(0.912345)),
            secondary_score: None,
            context: MatchContext {
                device_id: "door-3".into(),
                location: None,
                timestamp: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            },
            policy_override: None,
            include_embedding,
        };
        Orchestrator::new(OrchestratorConfig::default())
            .match_and_decide(&request, &set, &Policy::default())
            .unwrap()
    }

    #[test]
    fn test_record_core_fields() {
        let r = to_transport_record(&package(false)).unwrap();
        assert_eq!(r["STATUS"], "accepted");
        assert_eq!(r["ACTION"], "proceed");
        assert_eq!(r["MATCH_SCORE"], "1.0000");
        assert_eq!(r["LIVENESS_SCORE"], "0.9123");
        assert_eq!(r["IDENTITY_ID"], "emp-7");
        assert_eq!(r["ROLE"], "staff");
        assert_eq!(r["DEVICE_ID"], "door-3");
        assert_eq!(r["TS"], "2026-01-02T03:04:05+00:00");
        assert!(!r.contains_key("REASON"));
        assert!(!r.contains_key("LOCATION"));
        assert_eq!(r["CONFIDENCE"].split('.').nth(1).map(str::len), Some(2));
    }

    #[test]
    fn test_record_audit_array() {
        let pkg = package(false);
        let r = to_transport_record(&pkg).unwrap();
        assert_eq!(r["AUDIT_COUNT"], pkg.decision.audit_trail.len().to_string());
        assert_eq!(r["AUDIT[0].RULE"], "policy_validity");
        assert_eq!(r["AUDIT[2].RULE"], "similarity_gate");
        assert_eq!(r["AUDIT[2].OUTCOME"], "passed");
    }

    #[test]
    fn test_embedding_absent_by_default() {
        let r = to_transport_record(&package(false)).unwrap();
        assert!(r.keys().all(|k| !k.starts_with("EMB_")));
    }

    #[test]
    fn test_embedding_opt_in_reconstructs() {
        let r = to_transport_record(&package(true)).unwrap();
        let codes = hex::decode(&r["EMB_DATA"]).unwrap();
        assert_eq!(codes.len(), 3);
        let params = QuantParams {
            scale: r["EMB_SCALE"].parse().unwrap(),
            zero_point: r["EMB_ZP"].parse().unwrap(),
            bits: QuantBits::Eight,
            dimension: r["EMB_DIM"].parse().unwrap(),
        };
        let buffer = QuantizedBuffer::U8(codes.clone());
        assert_eq!(format!("{:08x}", quantize::fnv1a_32(&codes)), r["EMB_CRC"]);
        let restored = dequantize(&buffer, &params).unwrap();
        for (a, b) in restored.iter().zip([0.6f32, 0.8, 0.0]) {
            assert!((a - b).abs() < 0.01);
        }
    }

    #[test]
    fn test_array_tokens() {
        let items = vec![
            BTreeMap::from([("ID".to_string(), "a".to_string())]),
            BTreeMap::from([("ID".to_string(), "b".to_string())]),
        ];
        let t = array_tokens("CMD", &items);
        assert_eq!(t["CMD[0].ID"], "a");
        assert_eq!(t["CMD[1].ID"], "b");
        assert_eq!(t["CMD_COUNT"], "2");
    }

    #[test]
    fn test_canonical_string_sorted() {
        let mut r = TransportRecord::new();
        r.insert("TS".into(), "1".into());
        r.insert("ACTION".into(), "proceed".into());
        r.insert("MATCH_SCORE".into(), "0.9000".into());
        assert_eq!(canonical_string(&r), "ACTION:proceed|MATCH_SCORE:0.9000|TS:1");
    }
}
