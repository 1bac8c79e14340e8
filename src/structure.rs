//! Source-level class and annotation extraction.
//!
//! Parses one Java compilation unit with tree-sitter and produces the class
//! records and annotation targets a bytecode scan would have produced for it.
//! Simple names are qualified through the types the unit declares (nested
//! ones included, as `Outer$Inner`), then single-type imports, then
//! `java.lang`, then the compilation unit's own package.

use std::collections::HashMap;

use tree_sitter::{Node, Parser};

use crate::model::{AnnotationTarget, ClassRecord, ClassTargets, TargetKind};

pub const ACC_PUBLIC: u32 = 0x0001;
pub const ACC_PRIVATE: u32 = 0x0002;
pub const ACC_PROTECTED: u32 = 0x0004;
pub const ACC_STATIC: u32 = 0x0008;
pub const ACC_FINAL: u32 = 0x0010;
pub const ACC_INTERFACE: u32 = 0x0200;
pub const ACC_ABSTRACT: u32 = 0x0400;
pub const ACC_ANNOTATION: u32 = 0x2000;
pub const ACC_ENUM: u32 = 0x4000;

const PACKAGE_INFO: &str = "package-info";

const JAVA_LANG: &[&str] = &[
    "AutoCloseable",
    "Cloneable",
    "Comparable",
    "Deprecated",
    "Enum",
    "Error",
    "Exception",
    "FunctionalInterface",
    "Iterable",
    "Number",
    "Object",
    "Override",
    "Record",
    "Runnable",
    "RuntimeException",
    "SafeVarargs",
    "String",
    "SuppressWarnings",
    "Throwable",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceScan {
    pub package: String,
    pub classes: Vec<ClassRecord>,
    pub targets: Vec<ClassTargets>,
    /// Qualified names of supertypes and annotation types, first-use order.
    pub references: Vec<String>,
}

/// Scan one compilation unit. `file_name` becomes the classes' source file.
pub fn scan_source(source: &str, file_name: &str) -> Option<SourceScan> {
    if source.trim().is_empty() {
        return None;
    }

    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_java::LANGUAGE.into())
        .ok()?;
    let tree = parser.parse(source, None)?;
    let root = tree.root_node();
    let bytes = source.as_bytes();

    let mut unit = Unit {
        bytes,
        file_name,
        package: String::new(),
        imports: HashMap::new(),
        local: HashMap::new(),
        scan: SourceScan::default(),
    };

    let mut package_node = None;
    let mut types = Vec::new();
    let mut cursor = root.walk();
    for child in root.children(&mut cursor) {
        match child.kind() {
            "package_declaration" => {
                unit.package = extract_package(&child, bytes);
                package_node = Some(child);
            }
            "import_declaration" => unit.add_import(&child),
            kind if is_type_declaration(kind) => types.push(child),
            _ => {}
        }
    }
    unit.scan.package = unit.package.clone();
    for node in &types {
        unit.declare_local(node, None);
    }

    if let Some(node) = package_node {
        unit.package_annotations(&node);
    }
    for node in types {
        unit.type_declaration(&node, None);
    }

    Some(unit.scan)
}

struct Unit<'s> {
    bytes: &'s [u8],
    file_name: &'s str,
    package: String,
    imports: HashMap<String, String>,
    /// Simple name -> qualified binary name of every type in the unit.
    local: HashMap<String, String>,
    scan: SourceScan,
}

impl Unit<'_> {
    fn add_import(&mut self, node: &Node) {
        let mut path = String::new();
        let mut is_static = false;
        let mut wildcard = false;
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            match child.kind() {
                "static" => is_static = true,
                "asterisk" => wildcard = true,
                "scoped_identifier" | "identifier" => {
                    path = node_text(&child, self.bytes).to_string();
                }
                _ => {}
            }
        }
        if is_static || wildcard || path.is_empty() {
            return;
        }
        if let Some(simple) = path.rsplit('.').next() {
            self.imports.insert(simple.to_string(), path.clone());
        }
    }

    fn declare_local(&mut self, node: &Node, outer: Option<&str>) {
        let Some(simple) = node
            .child_by_field_name("name")
            .map(|n| node_text(&n, self.bytes).to_string())
        else {
            return;
        };
        let binary = match outer {
            Some(outer) => format!("{outer}${simple}"),
            None => simple.clone(),
        };
        let qualified = if self.package.is_empty() {
            binary.clone()
        } else {
            format!("{}.{binary}", self.package)
        };
        self.local.entry(simple).or_insert(qualified);

        if let Some(body) = node.child_by_field_name("body") {
            for child in nested_type_nodes(&body) {
                self.declare_local(&child, Some(&binary));
            }
        }
    }

    fn package_annotations(&mut self, node: &Node) {
        let annotations = annotations_of(node, self.bytes);
        if annotations.is_empty() || !self.file_name.starts_with(PACKAGE_INFO) {
            return;
        }
        let targets = annotations
            .iter()
            .map(|simple| AnnotationTarget {
                kind: TargetKind::Package,
                annotation: self.qualify(simple),
            })
            .collect::<Vec<_>>();
        for target in &targets {
            self.reference(target.annotation.clone());
        }
        let class_name = if self.package.is_empty() {
            PACKAGE_INFO.to_string()
        } else {
            format!("{}.{PACKAGE_INFO}", self.package)
        };
        push_targets(&mut self.scan.targets, class_name, targets);
    }

    fn type_declaration(&mut self, node: &Node, outer: Option<&str>) {
        let Some(simple) = node
            .child_by_field_name("name")
            .map(|n| node_text(&n, self.bytes).to_string())
        else {
            return;
        };
        let name = match outer {
            Some(outer) => format!("{outer}${simple}"),
            None => simple,
        };

        let (mut modifiers, class_annotations) = self.modifiers(node);
        let mut superclass = None;
        let mut interfaces = Vec::new();

        match node.kind() {
            "class_declaration" => {
                if let Some(sc) = node.child_by_field_name("superclass") {
                    superclass = first_type(&sc, self.bytes).map(|t| self.qualify(&t));
                }
                if let Some(si) = node.child_by_field_name("interfaces") {
                    interfaces = self.type_list(&si);
                }
            }
            "interface_declaration" => {
                modifiers |= ACC_INTERFACE | ACC_ABSTRACT;
                if let Some(ext) = find_child(node, "extends_interfaces") {
                    interfaces = self.type_list(&ext);
                }
            }
            "annotation_type_declaration" => {
                modifiers |= ACC_INTERFACE | ACC_ABSTRACT | ACC_ANNOTATION;
                interfaces.push("java.lang.annotation.Annotation".to_string());
            }
            "enum_declaration" => {
                modifiers |= ACC_ENUM | ACC_FINAL;
                superclass = Some("java.lang.Enum".to_string());
                if let Some(si) = node.child_by_field_name("interfaces") {
                    interfaces = self.type_list(&si);
                }
            }
            "record_declaration" => {
                modifiers |= ACC_FINAL;
                superclass = Some("java.lang.Record".to_string());
                if let Some(si) = node.child_by_field_name("interfaces") {
                    interfaces = self.type_list(&si);
                }
            }
            _ => {}
        }
        if outer.is_some() && node.kind() != "class_declaration" {
            modifiers |= ACC_STATIC;
        }
        if !matches!(node.kind(), "interface_declaration" | "annotation_type_declaration")
            && superclass.is_none()
        {
            superclass = Some("java.lang.Object".to_string());
        }

        if let Some(sc) = &superclass {
            self.reference(sc.clone());
        }
        for iface in &interfaces {
            self.reference(iface.clone());
        }

        let record = ClassRecord {
            package: self.package.clone(),
            name: name.clone(),
            source: Some(self.file_name.to_string()),
            superclass,
            interfaces,
            modifiers,
        };
        let qualified = record.qualified_name();
        self.scan.classes.push(record);

        let mut targets: Vec<AnnotationTarget> = class_annotations
            .iter()
            .map(|simple| AnnotationTarget {
                kind: TargetKind::Class,
                annotation: self.qualify(simple),
            })
            .collect();

        let mut nested = Vec::new();
        if let Some(body) = node.child_by_field_name("body") {
            self.members(&body, &mut targets, &mut nested);
        }

        for target in &targets {
            self.reference(target.annotation.clone());
        }
        push_targets(&mut self.scan.targets, qualified, targets);

        for child in nested {
            self.type_declaration(&child, Some(&name));
        }
    }

    fn members<'t>(
        &self,
        body: &Node<'t>,
        targets: &mut Vec<AnnotationTarget>,
        nested: &mut Vec<Node<'t>>,
    ) {
        let mut cursor = body.walk();
        for child in body.children(&mut cursor) {
            let kind = match child.kind() {
                "field_declaration" | "constant_declaration" => TargetKind::Field,
                "method_declaration"
                | "constructor_declaration"
                | "compact_constructor_declaration"
                | "annotation_type_element_declaration" => TargetKind::Method,
                "enum_body_declarations" => {
                    self.members(&child, targets, nested);
                    continue;
                }
                k if is_type_declaration(k) => {
                    nested.push(child);
                    continue;
                }
                _ => continue,
            };
            for simple in self.modifiers(&child).1 {
                targets.push(AnnotationTarget {
                    kind,
                    annotation: self.qualify(&simple),
                });
            }
        }
    }

    /// Access flags and annotation names from a declaration's modifiers.
    fn modifiers(&self, node: &Node) -> (u32, Vec<String>) {
        let Some(mods) = find_child(node, "modifiers") else {
            return (0, Vec::new());
        };
        let mut flags = 0u32;
        let mut cursor = mods.walk();
        for child in mods.children(&mut cursor) {
            flags |= match child.kind() {
                "public" => ACC_PUBLIC,
                "private" => ACC_PRIVATE,
                "protected" => ACC_PROTECTED,
                "static" => ACC_STATIC,
                "final" => ACC_FINAL,
                "abstract" => ACC_ABSTRACT,
                _ => 0,
            };
        }
        (flags, annotations_of(&mods, self.bytes))
    }

    fn type_list(&self, node: &Node) -> Vec<String> {
        let Some(list) = find_child(node, "type_list") else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut cursor = list.walk();
        for child in list.named_children(&mut cursor) {
            if let Some(name) = type_name(&child, self.bytes) {
                out.push(self.qualify(&name));
            }
        }
        out
    }

    fn qualify(&self, name: &str) -> String {
        if let Some((head, rest)) = name.split_once('.') {
            // `Outer.Inner` written against a type of this unit.
            if let Some(outer) = self.local.get(head) {
                return format!("{outer}${}", rest.replace('.', "$"));
            }
            if let Some(outer) = self.imports.get(head) {
                return format!("{outer}.{rest}");
            }
            // A capitalized head is a type of this package, not a package.
            if !self.package.is_empty() && head.starts_with(|c: char| c.is_ascii_uppercase()) {
                return format!("{}.{name}", self.package);
            }
            return name.to_string();
        }
        if let Some(full) = self.local.get(name) {
            return full.clone();
        }
        if let Some(full) = self.imports.get(name) {
            return full.clone();
        }
        if JAVA_LANG.contains(&name) {
            return format!("java.lang.{name}");
        }
        if self.package.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.package)
        }
    }

    fn reference(&mut self, name: String) {
        if !self.scan.references.contains(&name) {
            self.scan.references.push(name);
        }
    }
}

fn push_targets(out: &mut Vec<ClassTargets>, class_name: String, targets: Vec<AnnotationTarget>) {
    let mut annotations: Vec<AnnotationTarget> = Vec::with_capacity(targets.len());
    for target in targets {
        if !annotations.contains(&target) {
            annotations.push(target);
        }
    }
    if annotations.is_empty() {
        return;
    }
    out.push(ClassTargets {
        class_name,
        annotations,
    });
}

fn annotations_of(node: &Node, source: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if matches!(child.kind(), "marker_annotation" | "annotation")
            && let Some(name) = child.child_by_field_name("name")
        {
            out.push(node_text(&name, source).to_string());
        }
    }
    out
}

fn extract_package(node: &Node, source: &[u8]) -> String {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.kind() == "scoped_identifier" || child.kind() == "identifier" {
            return node_text(&child, source).to_string();
        }
    }
    String::new()
}

fn first_type(node: &Node, source: &[u8]) -> Option<String> {
    let mut cursor = node.walk();
    let found = node
        .named_children(&mut cursor)
        .find_map(|child| type_name(&child, source));
    found
}

/// Erased type name: `java.util.List<T>` becomes `java.util.List`.
fn type_name(node: &Node, source: &[u8]) -> Option<String> {
    match node.kind() {
        "type_identifier" | "scoped_type_identifier" | "generic_type" => {
            let text = node_text(node, source);
            let erased = text.split('<').next().unwrap_or(text);
            let name: String = erased.chars().filter(|c| !c.is_whitespace()).collect();
            if name.is_empty() { None } else { Some(name) }
        }
        _ => None,
    }
}

fn nested_type_nodes<'t>(body: &Node<'t>) -> Vec<Node<'t>> {
    let mut out = Vec::new();
    let mut cursor = body.walk();
    for child in body.children(&mut cursor) {
        if child.kind() == "enum_body_declarations" {
            out.extend(nested_type_nodes(&child));
        } else if is_type_declaration(child.kind()) {
            out.push(child);
        }
    }
    out
}

fn find_child<'a>(node: &Node<'a>, kind: &str) -> Option<Node<'a>> {
    let mut cursor = node.walk();
    let found = node.children(&mut cursor).find(|child| child.kind() == kind);
    found
}

fn is_type_declaration(kind: &str) -> bool {
    matches!(
        kind,
        "class_declaration"
            | "interface_declaration"
            | "enum_declaration"
            | "record_declaration"
            | "annotation_type_declaration"
    )
}

fn node_text<'a>(node: &Node, source: &'a [u8]) -> &'a str {
    node.utf8_text(source).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(scan: &SourceScan, class: &str) -> Vec<(TargetKind, String)> {
        scan.targets
            .iter()
            .find(|t| t.class_name == class)
            .map(|t| {
                t.annotations
                    .iter()
                    .map(|a| (a.kind, a.annotation.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn scan_annotated_class() {
        let source = r#"
package org.example;

import java.util.List;
import javax.ejb.Stateless;
import javax.inject.Inject;

@Stateless
public class Foo extends Bar implements java.io.Serializable, List<String> {
    @Inject
    private Service service;

    private int count;

    public Foo() {}

    @Deprecated
    public String getName() {
        return "";
    }
}
"#;
        let scan = scan_source(source, "Foo.java").unwrap();
        assert_eq!(scan.package, "org.example");
        assert_eq!(scan.classes.len(), 1);

        let foo = &scan.classes[0];
        assert_eq!(foo.qualified_name(), "org.example.Foo");
        assert_eq!(foo.source.as_deref(), Some("Foo.java"));
        assert_eq!(foo.superclass.as_deref(), Some("org.example.Bar"));
        assert_eq!(foo.interfaces, vec!["java.io.Serializable", "java.util.List"]);
        assert_eq!(foo.modifiers, ACC_PUBLIC);

        assert_eq!(
            annotations(&scan, "org.example.Foo"),
            vec![
                (TargetKind::Class, "javax.ejb.Stateless".to_string()),
                (TargetKind::Field, "javax.inject.Inject".to_string()),
                (TargetKind::Method, "java.lang.Deprecated".to_string()),
            ]
        );
        assert!(scan.references.contains(&"org.example.Bar".to_string()));
        assert!(scan.references.contains(&"javax.ejb.Stateless".to_string()));
    }

    #[test]
    fn scan_interface_and_annotation_type() {
        let source = r#"
package org.example;

public interface Service<T> extends Base<T>, AutoCloseable {
    T find(String id);
}
"#;
        let scan = scan_source(source, "Service.java").unwrap();
        let service = &scan.classes[0];
        assert_eq!(service.modifiers, ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT);
        assert_eq!(service.superclass, None);
        assert_eq!(
            service.interfaces,
            vec!["org.example.Base", "java.lang.AutoCloseable"]
        );
        assert!(scan.targets.is_empty());

        let source = r#"
package org.springframework.stereotype;

import java.lang.annotation.Retention;
import java.lang.annotation.RetentionPolicy;

@Retention(RetentionPolicy.RUNTIME)
public @interface Component {
    String value() default "";
}
"#;
        let scan = scan_source(source, "Component.java").unwrap();
        let component = &scan.classes[0];
        assert_ne!(component.modifiers & ACC_ANNOTATION, 0);
        assert_eq!(
            component.interfaces,
            vec!["java.lang.annotation.Annotation"]
        );
        assert_eq!(
            annotations(&scan, "org.springframework.stereotype.Component"),
            vec![(
                TargetKind::Class,
                "java.lang.annotation.Retention".to_string()
            )]
        );
    }

    #[test]
    fn scan_enum_with_annotated_members() {
        let source = r#"
package org.example;

public enum Color {
    RED,
    GREEN;

    @Deprecated
    private int value;

    @Override
    public String toString() {
        return "";
    }
}
"#;
        let scan = scan_source(source, "Color.java").unwrap();
        let color = &scan.classes[0];
        assert_eq!(color.superclass.as_deref(), Some("java.lang.Enum"));
        assert_ne!(color.modifiers & ACC_ENUM, 0);
        assert_eq!(
            annotations(&scan, "org.example.Color"),
            vec![
                (TargetKind::Field, "java.lang.Deprecated".to_string()),
                (TargetKind::Method, "java.lang.Override".to_string()),
            ]
        );
    }

    #[test]
    fn nested_types_use_binary_names() {
        let source = r#"
package org.example;

public class Outer {
    @Singleton
    public static class Inner {}

    interface Callback {}
}
"#;
        let scan = scan_source(source, "Outer.java").unwrap();
        let names: Vec<String> = scan.classes.iter().map(|c| c.qualified_name()).collect();
        assert_eq!(
            names,
            vec![
                "org.example.Outer",
                "org.example.Outer$Inner",
                "org.example.Outer$Callback"
            ]
        );
        assert_ne!(scan.classes[2].modifiers & ACC_STATIC, 0);
        assert_eq!(
            annotations(&scan, "org.example.Outer$Inner"),
            vec![(TargetKind::Class, "org.example.Singleton".to_string())]
        );
    }

    #[test]
    fn references_to_nested_types_use_binary_names() {
        let source = r#"
package org.example;

public class Outer {
    public static class Inner {}

    @Outer.Marker
    static class Child extends Inner implements Callback {}

    @interface Marker {}

    interface Callback {}
}
"#;
        let scan = scan_source(source, "Outer.java").unwrap();
        let child = scan
            .classes
            .iter()
            .find(|c| c.name == "Outer$Child")
            .unwrap();
        assert_eq!(child.superclass.as_deref(), Some("org.example.Outer$Inner"));
        assert_eq!(child.interfaces, vec!["org.example.Outer$Callback"]);
        assert_eq!(
            annotations(&scan, "org.example.Outer$Child"),
            vec![(TargetKind::Class, "org.example.Outer$Marker".to_string())]
        );
        assert!(scan.references.contains(&"org.example.Outer$Inner".to_string()));
    }

    #[test]
    fn package_info_yields_package_targets() {
        let source = r#"
@XmlSchema(namespace = "urn:acme")
package com.acme.model;

import javax.xml.bind.annotation.XmlSchema;
"#;
        let scan = scan_source(source, "package-info.java").unwrap();
        assert!(scan.classes.is_empty());
        assert_eq!(
            annotations(&scan, "com.acme.model.package-info"),
            vec![(
                TargetKind::Package,
                "javax.xml.bind.annotation.XmlSchema".to_string()
            )]
        );
    }

    #[test]
    fn scan_empty_source_returns_none() {
        assert!(scan_source("", "Empty.java").is_none());
        assert!(scan_source("   \n", "Empty.java").is_none());
    }
}
