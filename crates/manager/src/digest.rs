use serde_json::Value as Json;

/// Stable digest of a desired spec: 64-bit FNV-1a over the manifests and the
/// compact JSON of the renderer config, keys sorted.
pub fn spec_digest(manifests: &str, config: Option<&Json>) -> String {
    let mut h: u64 = 0xcbf29ce484222325;
    let mut feed = |bytes: &[u8]| {
        for b in bytes {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
    };
    feed(manifests.as_bytes());
    feed(&[0]);
    if let Some(cfg) = config {
        feed(canonical(cfg).to_string().as_bytes());
    }
    format!("{h:016x}")
}

fn canonical(v: &Json) -> Json {
    match v {
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            Json::Object(keys.into_iter().map(|k| (k.clone(), canonical(&map[k]))).collect())
        }
        Json::Array(items) => Json::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_tracks_manifests_and_config() {
        let a = spec_digest("kind: A", None);
        assert_eq!(a, spec_digest("kind: A", None));
        assert_eq!(a.len(), 16);
        assert_ne!(a, spec_digest("kind: B", None));
        assert_ne!(a, spec_digest("kind: A", Some(&serde_json::json!({"replicas": 2}))));
    }

    #[test]
    fn config_key_order_does_not_matter() {
        let x: Json = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let y: Json = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(spec_digest("m", Some(&x)), spec_digest("m", Some(&y)));
    }
}
