//! Canonical bencode encoder.
use crate::value::Value;

/// Encodes a value into its canonical bencode form.
///
/// Dictionary keys come out in lexicographic byte order (the only order the
/// wire format permits), so encoding is deterministic: the same value always
/// produces the same bytes. Info-hash computation depends on this.
#[must_use]
pub fn encode(value: &Value) -> Vec<u8> {
    let mut output = Vec::new();
    encode_into(value, &mut output);
    output
}

fn encode_into(value: &Value, output: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            output.push(b'i');
            output.extend_from_slice(n.to_string().as_bytes());
            output.push(b'e');
        }
        Value::Bytes(bytes) => encode_bytes(bytes, output),
        Value::List(items) => {
            output.push(b'l');
            for item in items {
                encode_into(item, output);
            }
            output.push(b'e');
        }
        Value::Dict(entries) => {
            output.push(b'd');
            // BTreeMap iterates keys in ascending byte order.
            for (key, item) in entries {
                encode_bytes(key, output);
                encode_into(item, output);
            }
            output.push(b'e');
        }
    }
}

fn encode_bytes(bytes: &[u8], output: &mut Vec<u8>) {
    output.extend_from_slice(bytes.len().to_string().as_bytes());
    output.push(b':');
    output.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use crate::encode::encode;
    use crate::value::Value;

    #[test]
    fn it_should_encode_each_variant() {
        assert_eq!(encode(&Value::Int(42)), b"i42e");
        assert_eq!(encode(&Value::Int(-7)), b"i-7e");
        assert_eq!(encode(&Value::bytes(b"spam")), b"4:spam");
        assert_eq!(encode(&Value::List(vec![])), b"le");
        assert_eq!(encode(&Value::Dict(crate::Dict::new())), b"de");
    }

    #[test]
    fn it_should_emit_dictionary_keys_in_lexicographic_byte_order() {
        let value = Value::dict_from([
            (&b"zz"[..], Value::Int(1)),
            (&b"a"[..], Value::Int(2)),
            (&b"ab"[..], Value::Int(3)),
        ]);

        assert_eq!(encode(&value), b"d1:ai2e2:abi3e2:zzi1ee");
    }

    #[test]
    fn it_should_encode_empty_byte_strings() {
        assert_eq!(encode(&Value::bytes(b"")), b"0:");
    }
}
