//! Pool keys and the configuration fingerprint used to bucket clients.
//!
//! Two callers asking for a producer/consumer with the same effective
//! `rdkafka::ClientConfig` should land in the same pool bucket even if they
//! built their `BrokerConfig` independently. We get that by hashing the
//! config's key/value pairs (in the fixed order `BrokerConfig::as_kv_pairs`
//! returns them) with `SipHash`, rather than hashing the struct itself or
//! comparing it field-by-field.

use std::hash::{Hash, Hasher};

use siphasher::sip::SipHasher13;

use crate::config::BrokerConfig;

/// A stable hash over a `BrokerConfig`'s effective `ClientConfig` entries.
/// Two configs that would produce identical `rdkafka::ClientConfig`s hash
/// identically regardless of field order or intermediate representation.
pub fn config_fingerprint(config: &BrokerConfig) -> u64 {
    let mut hasher = SipHasher13::new();
    for (k, v) in config.as_kv_pairs() {
        k.hash(&mut hasher);
        0u8.hash(&mut hasher); // separator, so ("a","bc") != ("ab","c")
        v.hash(&mut hasher);
        1u8.hash(&mut hasher);
    }
    hasher.finish()
}

/// Pool bucket key for producers: a type gets its own bucket per distinct
/// topic and broker configuration, since producers for the same type under
/// two different configs (e.g. different compression codecs) aren't
/// interchangeable. `topic_name` is folded in as a hash (rather than kept as
/// a `String`) so the key stays `Copy`, matching `config_fingerprint` and
/// `group_id_hash`'s existing treatment of string-shaped identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProducerKey {
    pub entity_type: std::any::TypeId,
    pub topic_name_hash: u64,
    pub config_fingerprint: u64,
}

impl ProducerKey {
    pub fn new<T: 'static>(config: &BrokerConfig, topic_name: &str) -> Self {
        let mut hasher = SipHasher13::new();
        topic_name.hash(&mut hasher);
        Self {
            entity_type: std::any::TypeId::of::<T>(),
            topic_name_hash: hasher.finish(),
            config_fingerprint: config_fingerprint(config),
        }
    }
}

/// Pool bucket key for consumers: additionally scoped by consumer group,
/// since two subscriptions in different groups must never share a client
/// (they have independent offsets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerKey {
    pub entity_type: std::any::TypeId,
    pub topic_name_hash: u64,
    pub config_fingerprint: u64,
    pub group_id_hash: u64,
}

impl ConsumerKey {
    pub fn new<T: 'static>(config: &BrokerConfig, topic_name: &str, group_id: &str) -> Self {
        let mut topic_hasher = SipHasher13::new();
        topic_name.hash(&mut topic_hasher);
        let mut group_hasher = SipHasher13::new();
        group_id.hash(&mut group_hasher);
        Self {
            entity_type: std::any::TypeId::of::<T>(),
            topic_name_hash: topic_hasher.finish(),
            config_fingerprint: config_fingerprint(config),
            group_id_hash: group_hasher.finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(codec: &str) -> BrokerConfig {
        let mut cfg = BrokerConfig::init_from_hashmap(&Default::default()).unwrap();
        cfg.compression_codec = codec.to_string();
        cfg
    }

    use envconfig::Envconfig;

    #[test]
    fn identical_configs_fingerprint_identically() {
        assert_eq!(config_fingerprint(&cfg("none")), config_fingerprint(&cfg("none")));
    }

    #[test]
    fn distinct_configs_fingerprint_differently() {
        assert_ne!(config_fingerprint(&cfg("none")), config_fingerprint(&cfg("gzip")));
    }

    #[test]
    fn producer_keys_distinguish_by_type() {
        struct A;
        struct B;
        let config = cfg("none");
        assert_ne!(
            ProducerKey::new::<A>(&config, "orders"),
            ProducerKey::new::<B>(&config, "orders")
        );
    }

    #[test]
    fn producer_keys_distinguish_by_topic() {
        struct A;
        let config = cfg("none");
        assert_ne!(
            ProducerKey::new::<A>(&config, "orders"),
            ProducerKey::new::<A>(&config, "payments")
        );
    }

    #[test]
    fn consumer_keys_distinguish_by_group() {
        struct A;
        let config = cfg("none");
        assert_ne!(
            ConsumerKey::new::<A>(&config, "orders", "group-a"),
            ConsumerKey::new::<A>(&config, "orders", "group-b")
        );
    }

    #[test]
    fn consumer_keys_distinguish_by_topic() {
        struct A;
        let config = cfg("none");
        assert_ne!(
            ConsumerKey::new::<A>(&config, "orders", "group-a"),
            ConsumerKey::new::<A>(&config, "payments", "group-a")
        );
    }
}
