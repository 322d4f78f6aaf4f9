// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::test::{make_labels, make_sample_key};
use pretty_assertions::assert_eq;

#[test]
fn labels_are_sorted() {
  let a = encode_labels(&make_labels(&[("b", "2"), ("a", "1")])).unwrap();
  let b = encode_labels(&make_labels(&[("a", "1"), ("b", "2")])).unwrap();
  assert_eq!(a, b);
  assert_eq!(
    make_labels(&[("a", "1"), ("b", "2")]),
    decode_labels(&a).unwrap()
  );
  assert_eq!(
    &[0, 2, 0, 1, b'a', 0, 1, b'1', 0, 1, b'b', 0, 1, b'2'][..],
    &a[..]
  );
}

#[test]
fn empty_label_set() {
  let encoded = encode_labels(&[]).unwrap();
  assert_eq!(&[0, 0][..], &encoded[..]);
  assert!(decode_labels(&encoded).unwrap().is_empty());
}

#[test]
fn label_too_long() {
  let long = "x".repeat(usize::from(u16::MAX) + 1);
  assert_eq!(
    Err(KeyError::LabelTooLong),
    encode_labels(&[Label::new(long, "v")])
  );
}

#[test]
fn decode_errors() {
  assert_eq!(Err(KeyError::Truncated), decode_labels(&[]));
  assert_eq!(Err(KeyError::Truncated), decode_labels(&[0, 1, 0, 5, b'a']));

  let mut encoded = encode_labels(&make_labels(&[("a", "1")])).unwrap().to_vec();
  encoded.push(0);
  assert_eq!(Err(KeyError::Truncated), decode_labels(&encoded));
}

#[test]
fn output_key_derivation() {
  let key = make_sample_key(&[("a", "1"), ("host", "x")], &[("a", "1")]);
  let input = encode_labels(&make_labels(&[("a", "1"), ("host", "x")])).unwrap();
  let output = encode_labels(&make_labels(&[("a", "1")])).unwrap();

  assert_eq!(&input[..], key.input_key());
  assert_eq!(&output[..], key.output_labels());
  assert_eq!(&output[..], get_output_key(&key, false));

  let mut expected = input.to_vec();
  expected.extend_from_slice(&output);
  assert_eq!(&expected[..], get_output_key(&key, true));
}

#[test]
fn output_key_differs_by_input() {
  let x = make_sample_key(&[("host", "x")], &[("a", "1")]);
  let y = make_sample_key(&[("host", "y")], &[("a", "1")]);
  assert_eq!(get_output_key(&x, false), get_output_key(&y, false));
  assert_ne!(get_output_key(&x, true), get_output_key(&y, true));
}

#[test]
fn interner() {
  let interner = KeyInterner::new();
  let a = interner.intern(b"a");
  let a2 = interner.intern(b"a");
  let b = interner.intern(b"b");
  assert!(Arc::ptr_eq(&a, &a2));
  assert_eq!(2, interner.len());

  drop(b);
  assert_eq!(1, interner.cleanup());
  assert_eq!(1, interner.len());

  drop(a);
  assert_eq!(0, interner.cleanup());
  drop(a2);
  assert_eq!(1, interner.cleanup());
  assert!(interner.is_empty());
}
