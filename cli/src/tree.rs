use cardlink::tlv::{self, Reader, Tlv};
use serde_json::{json, Value};

/// A TLV unit with its children parsed, if constructed.
pub struct Node<'a> {
    pub tlv: Tlv,
    pub value: &'a [u8],
    pub children: Vec<Node<'a>>,
}

pub fn parse(buffer: &[u8]) -> Result<Vec<Node<'_>>, tlv::Error> {
    parse_siblings(buffer, Reader::new(buffer))
}

fn parse_siblings<'a>(buffer: &'a [u8], reader: Reader<'a>) -> Result<Vec<Node<'a>>, tlv::Error> {
    reader
        .map(|tlv| {
            let tlv = tlv?;
            let children = match tlv.tag().is_constructed() {
                true => parse_siblings(buffer, Reader::within(buffer, tlv.value_range()))?,
                false => vec![],
            };

            Ok(Node {
                value: tlv.value(buffer),
                tlv,
                children,
            })
        })
        .collect()
}

pub fn print(nodes: &[Node<'_>], depth: usize) {
    for node in nodes {
        let tag = node.tlv.tag();
        let indent = "  ".repeat(depth);

        if tag.is_constructed() {
            println!(
                "{}{:X} @{} ({} octets)",
                indent,
                tag.raw(),
                node.tlv.offset(),
                node.tlv.length()
            );
            print(&node.children, depth + 1);
        } else {
            println!(
                "{}{:X} @{} = {}",
                indent,
                tag.raw(),
                node.tlv.offset(),
                hex::encode_upper(node.value)
            );
        }
    }
}

pub fn to_json(nodes: &[Node<'_>]) -> Value {
    nodes
        .iter()
        .map(|node| {
            let tag = node.tlv.tag();
            let mut object = json!({
                "tag": format!("{:X}", tag.raw()),
                "class": format!("{:?}", tag.class()),
                "number": tag.number(),
                "offset": node.tlv.offset(),
                "length": node.tlv.length(),
            });

            if tag.is_constructed() {
                object["children"] = to_json(&node.children);
            } else {
                object["value"] = Value::String(hex::encode_upper(node.value));
            }

            object
        })
        .collect()
}
