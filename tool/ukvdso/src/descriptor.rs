//
// Copyright 2025, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

/// This module is responsible for parsing the XML image descriptor, an
/// alternative to the plain symbol map that also lets a build tweak how the
/// image source is generated:
///
/// ```xml
/// <vdso_image name="vdso_image" section=".data..ro_after_init" align="4096"
///             constructor="uk_init_vdso" base_pointer="vdso_image_addr"
///             magic="0x369C2171" row_width="10">
///     <relocation symbol="__kernel_vsyscall" export="__kernel_vsyscall_addr" />
/// </vdso_image>
/// ```
///
/// Every attribute of `vdso_image` is optional. Everything is validated here
/// so that generation never runs with a half-understood descriptor.
use crate::emit::ImageOptions;
use crate::error::{Error, Result};
use crate::symbols::{SymbolMap, SymbolMapping};
use crate::util::{is_c_identifier, is_power_of_two, parse_number};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub options: ImageOptions,
    pub symbols: SymbolMap,
}

struct XmlDescriptor<'a> {
    filename: &'a str,
    doc: &'a roxmltree::Document<'a>,
}

fn loc_string(xml: &XmlDescriptor, pos: roxmltree::TextPos) -> String {
    format!("{}:{}:{}", xml.filename, pos.row, pos.col)
}

fn value_error(xml: &XmlDescriptor, node: &roxmltree::Node, err: String) -> Error {
    let pos = xml.doc.text_pos_at(node.range().start);
    Error::Descriptor(format!(
        "Error: {} on element '{}': {}",
        err,
        node.tag_name().name(),
        loc_string(xml, pos)
    ))
}

fn check_attributes(
    xml: &XmlDescriptor,
    node: &roxmltree::Node,
    attributes: &[&'static str],
) -> Result<()> {
    for attribute in node.attributes() {
        if !attributes.contains(&attribute.name()) {
            return Err(value_error(
                xml,
                node,
                format!("invalid attribute '{}'", attribute.name()),
            ));
        }
    }

    Ok(())
}

fn checked_lookup<'a>(
    xml: &XmlDescriptor,
    node: &'a roxmltree::Node,
    attribute: &'static str,
) -> Result<&'a str> {
    match node.attribute(attribute) {
        Some(value) => Ok(value),
        None => {
            let pos = xml.doc.text_pos_at(node.range().start);
            Err(Error::Descriptor(format!(
                "Error: Missing required attribute '{}' on element '{}': {}",
                attribute,
                node.tag_name().name(),
                loc_string(xml, pos)
            )))
        }
    }
}

fn identifier_attribute(
    xml: &XmlDescriptor,
    node: &roxmltree::Node,
    attribute: &'static str,
    default: &str,
) -> Result<String> {
    let value = node.attribute(attribute).unwrap_or(default);
    if !is_c_identifier(value) {
        return Err(value_error(
            xml,
            node,
            format!("'{value}' is not a valid C identifier for attribute '{attribute}'"),
        ));
    }
    Ok(value.to_string())
}

fn number_attribute(
    xml: &XmlDescriptor,
    node: &roxmltree::Node,
    attribute: &'static str,
    default: u64,
) -> Result<u64> {
    match node.attribute(attribute) {
        Some(value) => parse_number(value).map_err(|err| value_error(xml, node, err)),
        None => Ok(default),
    }
}

/// Ensure there is no non-whitespace text anywhere below `node`.
fn check_no_text(xml: &XmlDescriptor, node: &roxmltree::Node) -> Result<()> {
    for child in node.children() {
        if child.is_element() {
            check_no_text(xml, &child)?;
        } else if child.is_text() && !child.text().unwrap_or("").trim().is_empty() {
            let pos = xml.doc.text_pos_at(child.range().start);
            return Err(Error::Descriptor(format!(
                "Error: unexpected text found in element '{}' @ {}",
                node.tag_name().name(),
                loc_string(xml, pos)
            )));
        }
    }

    Ok(())
}

fn relocation_name(
    xml: &XmlDescriptor,
    node: &roxmltree::Node,
    attribute: &'static str,
) -> Result<String> {
    let value = checked_lookup(xml, node, attribute)?;
    if !is_c_identifier(value) {
        return Err(value_error(
            xml,
            node,
            format!("'{value}' is not a valid C identifier for attribute '{attribute}'"),
        ));
    }
    Ok(value.to_string())
}

fn parse_relocation(xml: &XmlDescriptor, node: &roxmltree::Node) -> Result<SymbolMapping> {
    check_attributes(xml, node, &["symbol", "export"])?;

    Ok(SymbolMapping {
        source_symbol: relocation_name(xml, node, "symbol")?,
        exported_name: relocation_name(xml, node, "export")?,
    })
}

pub fn parse(filename: &str, xml: &str) -> Result<ImageDescriptor> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|err| Error::Descriptor(format!("Could not parse '{filename}': {err}")))?;

    let xml_desc = XmlDescriptor {
        filename,
        doc: &doc,
    };

    let root = doc.root_element();
    if root.tag_name().name() != "vdso_image" {
        return Err(value_error(
            &xml_desc,
            &root,
            "expected root element 'vdso_image'".to_string(),
        ));
    }

    check_no_text(&xml_desc, &root)?;
    check_attributes(
        &xml_desc,
        &root,
        &[
            "name",
            "section",
            "align",
            "constructor",
            "base_pointer",
            "magic",
            "row_width",
        ],
    )?;

    let defaults = ImageOptions::default();

    let align = number_attribute(&xml_desc, &root, "align", defaults.align)?;
    if !is_power_of_two(align) {
        return Err(value_error(
            &xml_desc,
            &root,
            format!("align {align:#x} is not a power of two"),
        ));
    }

    let magic = number_attribute(&xml_desc, &root, "magic", defaults.magic as u64)?;
    let magic = u32::try_from(magic).map_err(|_| {
        value_error(
            &xml_desc,
            &root,
            format!("magic {magic:#x} does not fit in 32 bits"),
        )
    })?;

    let row_width = number_attribute(&xml_desc, &root, "row_width", defaults.row_width as u64)?;
    if row_width == 0 {
        return Err(value_error(
            &xml_desc,
            &root,
            "row_width must be at least 1".to_string(),
        ));
    }

    let section = root.attribute("section").unwrap_or(&defaults.section);
    if section.is_empty() || section.contains(['"', '\\']) || section.contains(char::is_whitespace) {
        return Err(value_error(
            &xml_desc,
            &root,
            format!("invalid section name '{section}'"),
        ));
    }

    let options = ImageOptions {
        magic,
        struct_name: identifier_attribute(&xml_desc, &root, "name", &defaults.struct_name)?,
        section: section.to_string(),
        align,
        constructor: identifier_attribute(&xml_desc, &root, "constructor", &defaults.constructor)?,
        base_pointer: identifier_attribute(
            &xml_desc,
            &root,
            "base_pointer",
            &defaults.base_pointer,
        )?,
        row_width: row_width as usize,
    };

    let mut relocations = Vec::new();
    for child in root.children() {
        if !child.is_element() {
            continue;
        }

        match child.tag_name().name() {
            "relocation" => relocations.push(parse_relocation(&xml_desc, &child)?),
            other => {
                let pos = xml_desc.doc.text_pos_at(child.range().start);
                return Err(Error::Descriptor(format!(
                    "Error: invalid XML element '{}': {}",
                    other,
                    loc_string(&xml_desc, pos)
                )));
            }
        }
    }

    let symbols = SymbolMap::new(relocations);
    symbols.validate(filename)?;
    symbols.check_reserved_names(filename, &options)?;

    Ok(ImageDescriptor { options, symbols })
}
