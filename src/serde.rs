use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use serde::de::{self, value::MapAccessDeserializer, MapAccess, Unexpected, Visitor};
use serde::{Deserialize, Deserializer};
use void::{ResultVoidExt, Void};

/// Deserializes one servers file entry.
///
/// `- node01` names the host only and is built with `FromStr`, which cannot
/// fail. A mapping goes through the entry's own `Deserialize`. An empty
/// hostname is rejected here, before it turns into an unreachable server.
pub fn hostname_or_mapping<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: Deserialize<'de> + FromStr<Err = Void>,
    D: Deserializer<'de>,
{
    struct Entry<T>(PhantomData<fn() -> T>);

    impl<'de, T> Visitor<'de> for Entry<T>
    where
        T: Deserialize<'de> + FromStr<Err = Void>,
    {
        type Value = T;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a hostname or a mapping with `ip` and optional `id`, `port` and attributes")
        }

        fn visit_str<E>(self, hostname: &str) -> Result<T, E>
        where
            E: de::Error,
        {
            let hostname = hostname.trim();
            if hostname.is_empty() {
                return Err(E::invalid_value(Unexpected::Str(hostname), &self));
            }
            Ok(hostname.parse::<T>().void_unwrap())
        }

        fn visit_map<M>(self, fields: M) -> Result<T, M::Error>
        where
            M: MapAccess<'de>,
        {
            T::deserialize(MapAccessDeserializer::new(fields))
        }
    }

    deserializer.deserialize_any(Entry(PhantomData))
}
