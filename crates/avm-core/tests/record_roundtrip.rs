//! Tests for instance records split between the automatic and the manual region.

use std::sync::Arc;

use avm_core::{
    builtins::{self, BUILTIN_TYPES},
    codec::{Decoder, Encoder},
    ClassId, ElementKind, FieldKind, HeapObject, InstanceId, ManualFieldCodec, SplitBoundary,
    StreamCorruption, TypeRegistry, TypedContainer, Value,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rstest::rstest;

/// Writes its group back to front.
#[derive(Debug)]
struct ReversedCodec;

impl ManualFieldCodec for ReversedCodec {
    fn encode(&self, kinds: &[FieldKind], values: &[Value], enc: &mut Encoder) {
        for (kind, value) in kinds.iter().zip(values).rev() {
            value.encode_as(*kind, enc);
        }
    }

    fn decode(
        &self,
        kinds: &[FieldKind],
        dec: &mut Decoder<'_>,
    ) -> Result<Vec<Value>, StreamCorruption> {
        let mut values = kinds
            .iter()
            .rev()
            .map(|kind| Ok(Value::decode_as(*kind, dec)?))
            .collect::<Result<Vec<_>, StreamCorruption>>()?;
        values.reverse();
        Ok(values)
    }
}

fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs.iter().map(|(name, desc)| (name.to_string(), desc.to_string())).collect()
}

/// `Base` (automatic) <- `Mid` (manual, reversed) <- `Leaf` (manual, declared order).
fn registry() -> (TypeRegistry, [ClassId; 3]) {
    let mut registry = TypeRegistry::new();
    let base = registry
        .register("Base", Some(builtins::OBJECT), fields(&[("a", "I"), ("b", "J")]), vec![])
        .unwrap();
    let mid = registry
        .register_with_codec(
            "Mid",
            Some("Base"),
            fields(&[("c", "D"), ("d", "LBase;"), ("e", "F")]),
            vec![],
            Some(Arc::new(ReversedCodec)),
        )
        .unwrap();
    let leaf = registry
        .register(
            "Leaf",
            Some("Mid"),
            fields(&[("f", "S"), ("g", "Z"), ("h", "C"), ("i", "B")]),
            vec![],
        )
        .unwrap();
    (registry, [base, mid, leaf])
}

fn random_value(rng: &mut StdRng, kind: FieldKind) -> Value {
    match kind {
        FieldKind::Boolean => Value::Int(rng.random_bool(0.5) as i32),
        FieldKind::Byte => Value::Int(rng.random::<i8>() as i32),
        FieldKind::Char => Value::Int(rng.random::<u16>() as i32),
        FieldKind::Short => Value::Int(rng.random::<i16>() as i32),
        FieldKind::Int => Value::Int(rng.random()),
        FieldKind::Long => Value::Long(rng.random()),
        FieldKind::Float => Value::Float(rng.random()),
        FieldKind::Double => Value::Double(rng.random()),
        FieldKind::Reference => {
            Value::Ref(rng.random_bool(0.7).then(|| InstanceId(rng.random_range(1..1_000))))
        }
    }
}

fn random_instance(rng: &mut StdRng, registry: &TypeRegistry, class: ClassId) -> HeapObject {
    let layout = registry.layout(class).unwrap();
    let fields = layout.fields.iter().map(|field| random_value(rng, field.kind)).collect();
    HeapObject::instance(rng.random(), class, fields)
}

#[test]
fn test_registered_boundaries() {
    let (registry, [base, mid, leaf]) = registry();
    assert_eq!(registry.layout(base).unwrap().boundary, 2);
    // The universal base, `Base`, then the manual groups.
    assert_eq!(registry.layout(mid).unwrap().boundary, 2);
    assert_eq!(registry.layout(leaf).unwrap().boundary, 2);
    assert_eq!(registry.layout(leaf).unwrap().groups.len(), 4);
}

#[rstest]
#[case::registered(None)]
#[case::all_automatic(Some(usize::MAX))]
#[case::at_object(Some(0))]
#[case::at_base(Some(1))]
#[case::at_mid(Some(2))]
#[case::at_leaf(Some(3))]
fn test_every_split_roundtrips(#[case] split: Option<usize>) {
    let (registry, classes) = registry();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for class in classes {
        let chain = registry.layout(class).unwrap().chain.clone();
        let boundary = match split {
            None => SplitBoundary::Registered,
            Some(usize::MAX) => SplitBoundary::AllAutomatic,
            Some(depth) => match chain.get(depth) {
                Some(&ancestor) => SplitBoundary::At(ancestor),
                None => continue,
            },
        };
        for _ in 0..32 {
            let object = random_instance(&mut rng, &registry, class);
            let bytes = object.encode(&registry, boundary).unwrap();
            assert_eq!(HeapObject::decode(&bytes, &registry, boundary).unwrap(), object);
        }
    }
}

#[test]
fn test_manual_region_follows_its_codec() {
    let (registry, [_, mid, _]) = registry();
    let fields = vec![
        Value::Int(1),
        Value::Long(2),
        Value::Double(0.5),
        Value::Ref(None),
        Value::Float(1.0),
    ];
    let object = HeapObject::instance(5, mid, fields);
    let index = BUILTIN_TYPES.len() as u16 + 1;

    let mut expected = vec![1];
    expected.extend(index.to_be_bytes());
    expected.extend(hex::decode("00000005").unwrap());
    // Automatic: `a`, `b` in declaration order.
    expected.extend(hex::decode("00000001").unwrap());
    expected.extend(hex::decode("0000000000000002").unwrap());
    // Manual: `e`, `d`, `c` reversed.
    expected.extend(hex::decode("3f800000").unwrap());
    expected.extend(hex::decode("0000000000000000").unwrap());
    expected.extend(hex::decode("3fe0000000000000").unwrap());
    assert_eq!(object.encode(&registry, SplitBoundary::Registered).unwrap(), expected);

    // The same record read all-automatic misplaces the manual fields.
    let misread = HeapObject::decode(&expected, &registry, SplitBoundary::AllAutomatic).unwrap();
    assert_ne!(misread, object);
}

#[test]
fn test_containers_roundtrip() {
    let (registry, _) = registry();
    let mut rng = StdRng::seed_from_u64(7);
    for kind in ElementKind::ALL {
        let length = rng.random_range(0..16);
        let mut container = TypedContainer::new(kind, length).unwrap();
        for index in 0..length {
            let value = match kind {
                ElementKind::Byte => random_value(&mut rng, FieldKind::Byte),
                ElementKind::Char => random_value(&mut rng, FieldKind::Char),
                ElementKind::Short => random_value(&mut rng, FieldKind::Short),
                ElementKind::Int => random_value(&mut rng, FieldKind::Int),
                ElementKind::Long => random_value(&mut rng, FieldKind::Long),
                ElementKind::Float => random_value(&mut rng, FieldKind::Float),
                ElementKind::Double => random_value(&mut rng, FieldKind::Double),
                ElementKind::Object => random_value(&mut rng, FieldKind::Reference),
            };
            container.set(index, value).unwrap();
        }
        let object = HeapObject::container(rng.random(), container);
        let bytes = object.encode(&registry, SplitBoundary::Registered).unwrap();
        let decoded = HeapObject::decode(&bytes, &registry, SplitBoundary::Registered).unwrap();
        assert_eq!(decoded, object);
    }
}
