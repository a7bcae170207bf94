use std::collections::BTreeSet;

use crate::{
    codec::{Decoder, Encoder},
    InstanceId, StreamCorruption, TypeRegistry, Value,
};

/// The per-contract record anchoring the persisted graph.
///
/// It holds the allocation counters, the ids of every persisted instance and every static
/// field. Statics are the only roots of reachability.
#[derive(Debug, Clone, PartialEq)]
pub struct RootRecord {
    /// The id the next allocation receives. `0` is reserved for null.
    pub next_id: u64,
    /// The identity hash the next allocation receives.
    pub next_hash: i32,
    /// Ids of every instance that has a record.
    pub live: BTreeSet<InstanceId>,
    /// Static field values, in registry order.
    pub statics: Vec<Value>,
}

impl RootRecord {
    /// The root of a freshly deployed contract.
    pub fn fresh(registry: &TypeRegistry) -> Self {
        Self {
            next_id: 1,
            next_hash: 1,
            live: BTreeSet::new(),
            statics: registry.statics().iter().map(|field| Value::default_of(field.kind)).collect(),
        }
    }

    /// Non-null references held by statics.
    pub fn references(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.statics.iter().filter_map(Value::referent)
    }

    /// Encodes the record.
    pub fn encode(&self, registry: &TypeRegistry) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(16 + self.live.len() * 8);
        enc.encode_u64(self.next_id).encode_int(self.next_hash).encode_u32(self.live.len() as u32);
        for id in &self.live {
            enc.encode_u64(id.0);
        }
        for (field, value) in registry.statics().iter().zip(&self.statics) {
            value.encode_as(field.kind, &mut enc);
        }
        enc.into_vec()
    }

    /// Decodes a record written by [`RootRecord::encode`] against the same registry.
    pub fn decode(bytes: &[u8], registry: &TypeRegistry) -> Result<Self, StreamCorruption> {
        let mut dec = Decoder::new(bytes);
        let next_id = dec.decode_u64()?;
        let next_hash = dec.decode_int()?;
        let count = dec.decode_u32()? as usize;
        if count.saturating_mul(8) > dec.remaining() {
            return Err(crate::codec::CodecError::StreamExhausted {
                needed: count.saturating_mul(8),
                remaining: dec.remaining(),
            }
            .into());
        }
        let live = (0..count)
            .map(|_| dec.decode_u64().map(InstanceId))
            .collect::<Result<BTreeSet<_>, _>>()?;
        let statics = registry
            .statics()
            .iter()
            .map(|field| Value::decode_as(field.kind, &mut dec))
            .collect::<Result<Vec<_>, _>>()?;
        dec.finish()?;
        Ok(Self { next_id, next_hash, live, statics })
    }
}
