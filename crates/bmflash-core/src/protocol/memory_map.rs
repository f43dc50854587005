//! Target memory-map extraction.
//!
//! The probe describes the attached target with the GDB memory-map XML
//! document:
//!
//! ```xml
//! <memory-map>
//!   <memory type="flash" start="0x08000000" length="0x20000">
//!     <property name="blocksize">0x400</property>
//!   </memory>
//!   <memory type="ram" start="0x20000000" length="0x5000"/>
//! </memory-map>
//! ```
//!
//! Only the `memory` elements and their `blocksize` property matter, so
//! this is a tolerant scanner rather than a full XML parser.

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_until, take_while1},
    character::complete::{char, multispace0, multispace1},
    multi::many0,
    sequence::{delimited, preceded, terminated, tuple},
};

/// Kind of a `memory` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryKind {
    Flash,
    Ram,
    Rom,
    Other(String),
}

impl MemoryKind {
    fn from_attr(value: &str) -> Self {
        match value {
            "flash" => MemoryKind::Flash,
            "ram" => MemoryKind::Ram,
            "rom" => MemoryKind::Rom,
            other => MemoryKind::Other(other.to_string()),
        }
    }
}

/// One `memory` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub kind: MemoryKind,
    pub start: u32,
    pub length: u32,
    pub block_size: Option<u32>,
}

/// Extract every well-formed `memory` element from `xml`, in document order.
/// Elements with a missing or unparseable `start`/`length` are skipped.
pub fn parse_memory_map(xml: &str) -> Vec<MemoryRegion> {
    let mut regions = Vec::new();
    let mut rest = xml;

    while let Some(pos) = rest.find("<memory") {
        rest = &rest[pos..];
        match memory_element(rest) {
            Ok((remaining, Some(region))) => {
                regions.push(region);
                rest = remaining;
            }
            Ok((remaining, None)) => rest = remaining,
            // `<memory-map>` and friends land here.
            Err(_) => rest = &rest["<memory".len()..],
        }
    }

    regions
}

/// Parse a number as written in the memory map: `0x` hex or decimal.
pub fn parse_number(text: &str) -> Option<u32> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn attribute(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, name) = preceded(
        multispace0,
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
    )(input)?;
    let (input, _) = delimited(multispace0, char('='), multispace0)(input)?;
    let (input, value) = alt((
        delimited(char('"'), take_until("\""), char('"')),
        delimited(char('\''), take_until("'"), char('\'')),
    ))(input)?;
    Ok((input, (name, value)))
}

fn find_attr<'a>(attrs: &[(&str, &'a str)], name: &str) -> Option<&'a str> {
    attrs.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
}

/// `<property name="...">value</property>`
fn property(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, (_, attrs, _, _)) = tuple((
        preceded(multispace0, tag("<property")),
        many0(attribute),
        multispace0,
        char('>'),
    ))(input)?;
    let (input, value) = terminated(take_until("</property>"), tag("</property>"))(input)?;
    let name = find_attr(&attrs, "name").unwrap_or("");
    Ok((input, (name, value)))
}

fn memory_element(input: &str) -> IResult<&str, Option<MemoryRegion>> {
    let (input, attrs) =
        preceded(terminated(tag("<memory"), multispace1), many0(attribute))(input)?;
    let (input, _) = multispace0(input)?;
    let (input, closing) = alt((tag("/>"), tag(">")))(input)?;

    let (input, properties) = if closing == ">" {
        let (input, body) = take_until("</memory>")(input)?;
        let (input, _) = tag("</memory>")(input)?;
        let (_, properties) = many0(property)(body)?;
        (input, properties)
    } else {
        (input, Vec::new())
    };

    let start = find_attr(&attrs, "start").and_then(parse_number);
    let length = find_attr(&attrs, "length").and_then(parse_number);
    let region = match (start, length) {
        (Some(start), Some(length)) => Some(MemoryRegion {
            kind: MemoryKind::from_attr(find_attr(&attrs, "type").unwrap_or("")),
            start,
            length,
            block_size: properties
                .iter()
                .find(|(name, _)| *name == "blocksize")
                .and_then(|(_, value)| parse_number(value)),
        }),
        _ => None,
    };

    Ok((input, region))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const STM32_MAP: &str = r#"<?xml version="1.0"?>
<!DOCTYPE memory-map PUBLIC "+//IDN gnu.org//DTD GDB Memory Map V1.0//EN" "http://sourceware.org/gdb/gdb-memory-map.dtd">
<memory-map>
  <memory type="ram" start="0x20000000" length="0x5000"/>
  <memory type="flash" start="0x08000000" length="0x10000">
    <property name="blocksize">0x400</property>
  </memory>
</memory-map>"#;

    #[test]
    fn test_parse_regions() {
        let regions = parse_memory_map(STM32_MAP);
        assert_eq!(
            regions,
            vec![
                MemoryRegion {
                    kind: MemoryKind::Ram,
                    start: 0x2000_0000,
                    length: 0x5000,
                    block_size: None,
                },
                MemoryRegion {
                    kind: MemoryKind::Flash,
                    start: 0x0800_0000,
                    length: 0x10000,
                    block_size: Some(0x400),
                },
            ]
        );
    }

    #[test]
    fn test_compact_markup_without_whitespace() {
        let xml = "<memory-map><memory type='flash' start='0x0' length='4096'><property name='blocksize'>256</property></memory></memory-map>";
        let regions = parse_memory_map(xml);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].length, 4096);
        assert_eq!(regions[0].block_size, Some(256));
    }

    #[test]
    fn test_malformed_element_is_skipped() {
        let xml = r#"<memory-map>
  <memory type="flash" start="bogus" length="0x100"/>
  <memory type="flash" start="0x1000" length="0x100"/>
</memory-map>"#;
        let regions = parse_memory_map(xml);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].start, 0x1000);
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("0x400"), Some(0x400));
        assert_eq!(parse_number(" 1024 "), Some(1024));
        assert_eq!(parse_number("0xZZ"), None);
    }
}
