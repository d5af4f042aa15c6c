//! Rust source parser built on `syn`.
//!
//! Produces, per file:
//!
//! | Item | Entity | Edges |
//! |------|--------|-------|
//! | inline `mod m { .. }` | `module` `m` | `m` contains its items |
//! | `struct` / `enum` / `trait` | `class` | trait contains its default methods |
//! | free `fn`, impl and trait methods | `function` (`Type::method`) | type contains method when the type is in the same file |
//! | `use root::..` | external `module` `root` | file imports root |
//! | call `f(..)` / `x.f(..)` | | caller calls every function named `f` in the file |
//!
//! Calls are resolved by simple name within the file only; calls inside
//! macro invocations are not seen.

use std::collections::{BTreeSet, HashMap, HashSet};

use proc_macro2::Span;
use syn::spanned::Spanned;
use syn::visit::{self, Visit};

use reporover_core::capability::{ParsedFile, RawEntity, RawRef, RawRelation, SourceParser};
use reporover_core::error::ParseError;
use reporover_core::models::{EntityKind, FileBlob, RelationKind};

#[derive(Debug, Default, Clone, Copy)]
pub struct RustParser;

impl SourceParser for RustParser {
    fn handles(&self, path: &str) -> bool {
        path.ends_with(".rs")
    }

    fn parse(&self, file: &FileBlob) -> Result<ParsedFile, ParseError> {
        let syntax = syn::parse_file(&file.content).map_err(|e| {
            let line = e.span().start().line;
            ParseError::new(&file.path, format!("line {}: {}", line, e))
        })?;
        let mut visitor = ItemVisitor::new(&file.content);
        visitor.visit_file(&syntax);
        Ok(visitor.finish())
    }
}

#[derive(Debug, Clone)]
enum Scope {
    Module(String),
    Class(String),
    /// `impl Type`: methods are qualified by the type but only linked to it
    /// when the type is defined in this file.
    Impl(String),
}

impl Scope {
    fn qualified_name(&self) -> &str {
        match self {
            Scope::Module(q) | Scope::Class(q) | Scope::Impl(q) => q,
        }
    }
}

struct ItemVisitor<'a> {
    lines: Vec<&'a str>,
    scope: Vec<Scope>,
    entities: Vec<RawEntity>,
    seen: HashSet<(EntityKind, String)>,
    relations: Vec<RawRelation>,
    fn_stack: Vec<String>,
    /// (caller, callee simple name)
    calls: Vec<(String, String)>,
    /// (type, method)
    impl_methods: Vec<(String, String)>,
    imports: BTreeSet<String>,
}

impl<'a> ItemVisitor<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            lines: source.lines().collect(),
            scope: Vec::new(),
            entities: Vec::new(),
            seen: HashSet::new(),
            relations: Vec::new(),
            fn_stack: Vec::new(),
            calls: Vec::new(),
            impl_methods: Vec::new(),
            imports: BTreeSet::new(),
        }
    }

    fn qualify(&self, name: &str) -> String {
        match self.scope.last() {
            Some(s) => format!("{}::{}", s.qualified_name(), name),
            None => name.to_string(),
        }
    }

    /// Record an entity under the current scope. Returns false for a
    /// duplicate (e.g. `fmt` from two trait impls of one type).
    fn add(&mut self, kind: EntityKind, qualified_name: &str, span: Span) -> bool {
        if !self.seen.insert((kind, qualified_name.to_string())) {
            return false;
        }
        let start = span.start().line.max(1);
        let end = span.end().line.max(start);
        let body = self
            .lines
            .get(start - 1..end.min(self.lines.len()))
            .map(|l| l.join("\n"))
            .unwrap_or_default();
        self.entities.push(
            RawEntity::new(kind, qualified_name)
                .lines(start as u32, end as u32)
                .body(body),
        );

        let target = RawRef::local(kind, qualified_name);
        match self.scope.last() {
            Some(Scope::Module(m)) => self.relations.push(RawRelation::new(
                RawRef::local(EntityKind::Module, m.clone()),
                target,
                RelationKind::Contains,
            )),
            Some(Scope::Class(c)) => self.relations.push(RawRelation::new(
                RawRef::local(EntityKind::Class, c.clone()),
                target,
                RelationKind::Contains,
            )),
            Some(Scope::Impl(t)) => self
                .impl_methods
                .push((t.clone(), qualified_name.to_string())),
            None => {}
        }
        true
    }

    fn visit_function<F: FnOnce(&mut Self)>(&mut self, name: &str, span: Span, walk: F) {
        let qualified = self.qualify(name);
        self.add(EntityKind::Function, &qualified, span);
        self.fn_stack.push(qualified);
        walk(self);
        self.fn_stack.pop();
    }

    fn record_call(&mut self, callee: String) {
        if let Some(caller) = self.fn_stack.last() {
            self.calls.push((caller.clone(), callee));
        }
    }

    fn finish(mut self) -> ParsedFile {
        let local_modules: HashSet<String> = self
            .entities
            .iter()
            .filter(|e| e.kind == EntityKind::Module)
            .map(|e| e.qualified_name.clone())
            .collect();
        let classes: HashSet<String> = self
            .entities
            .iter()
            .filter(|e| e.kind == EntityKind::Class)
            .map(|e| e.qualified_name.clone())
            .collect();

        for root in std::mem::take(&mut self.imports) {
            let target = if local_modules.contains(&root) {
                RawRef::local(EntityKind::Module, root)
            } else {
                let external = RawEntity::new(EntityKind::Module, root).external();
                let r = external.reference();
                self.entities.push(external);
                r
            };
            self.relations
                .push(RawRelation::new(RawRef::file(), target, RelationKind::Imports));
        }

        for (ty, method) in std::mem::take(&mut self.impl_methods) {
            let method = RawRef::local(EntityKind::Function, method);
            let rel = if classes.contains(&ty) {
                RawRelation::new(
                    RawRef::local(EntityKind::Class, ty),
                    method,
                    RelationKind::Contains,
                )
            } else {
                RawRelation::new(RawRef::file(), method, RelationKind::Defines)
            };
            self.relations.push(rel);
        }

        let mut by_name: HashMap<&str, Vec<&str>> = HashMap::new();
        for e in self.entities.iter().filter(|e| e.kind == EntityKind::Function) {
            by_name
                .entry(e.name.as_str())
                .or_default()
                .push(e.qualified_name.as_str());
        }
        let mut call_edges = Vec::new();
        let mut seen_calls = HashSet::new();
        for (caller, callee) in &self.calls {
            for target in by_name.get(callee.as_str()).into_iter().flatten() {
                if *target == caller.as_str() || !seen_calls.insert((caller.as_str(), *target)) {
                    continue;
                }
                call_edges.push(RawRelation::new(
                    RawRef::local(EntityKind::Function, caller.clone()),
                    RawRef::local(EntityKind::Function, *target),
                    RelationKind::Calls,
                ));
            }
        }
        self.relations.extend(call_edges);

        ParsedFile {
            entities: self.entities,
            relations: self.relations,
        }
    }
}

impl<'ast> Visit<'ast> for ItemVisitor<'_> {
    fn visit_item_fn(&mut self, node: &'ast syn::ItemFn) {
        let name = node.sig.ident.to_string();
        self.visit_function(&name, node.span(), |v| visit::visit_item_fn(v, node));
    }

    fn visit_impl_item_fn(&mut self, node: &'ast syn::ImplItemFn) {
        let name = node.sig.ident.to_string();
        self.visit_function(&name, node.span(), |v| visit::visit_impl_item_fn(v, node));
    }

    fn visit_trait_item_fn(&mut self, node: &'ast syn::TraitItemFn) {
        // Only methods with a default body are code.
        if node.default.is_none() {
            return;
        }
        let name = node.sig.ident.to_string();
        self.visit_function(&name, node.span(), |v| visit::visit_trait_item_fn(v, node));
    }

    fn visit_item_struct(&mut self, node: &'ast syn::ItemStruct) {
        let qualified = self.qualify(&node.ident.to_string());
        self.add(EntityKind::Class, &qualified, node.span());
    }

    fn visit_item_enum(&mut self, node: &'ast syn::ItemEnum) {
        let qualified = self.qualify(&node.ident.to_string());
        self.add(EntityKind::Class, &qualified, node.span());
    }

    fn visit_item_trait(&mut self, node: &'ast syn::ItemTrait) {
        let qualified = self.qualify(&node.ident.to_string());
        self.add(EntityKind::Class, &qualified, node.span());
        self.scope.push(Scope::Class(qualified));
        visit::visit_item_trait(self, node);
        self.scope.pop();
    }

    fn visit_item_impl(&mut self, node: &'ast syn::ItemImpl) {
        let Some(type_name) = type_name(&node.self_ty) else {
            return;
        };
        let qualified = self.qualify(&type_name);
        self.scope.push(Scope::Impl(qualified));
        visit::visit_item_impl(self, node);
        self.scope.pop();
    }

    fn visit_item_mod(&mut self, node: &'ast syn::ItemMod) {
        // `mod foo;` lives in its own file.
        if node.content.is_none() {
            return;
        }
        let qualified = self.qualify(&node.ident.to_string());
        self.add(EntityKind::Module, &qualified, node.span());
        self.scope.push(Scope::Module(qualified));
        visit::visit_item_mod(self, node);
        self.scope.pop();
    }

    fn visit_item_use(&mut self, node: &'ast syn::ItemUse) {
        self.imports.extend(use_roots(&node.tree));
    }

    fn visit_expr_call(&mut self, node: &'ast syn::ExprCall) {
        if let syn::Expr::Path(p) = node.func.as_ref() {
            if let Some(last) = p.path.segments.last() {
                self.record_call(last.ident.to_string());
            }
        }
        visit::visit_expr_call(self, node);
    }

    fn visit_expr_method_call(&mut self, node: &'ast syn::ExprMethodCall) {
        self.record_call(node.method.to_string());
        visit::visit_expr_method_call(self, node);
    }
}

/// Last path segment of an impl's self type, e.g. `Parser` for `crate::Parser<T>`.
fn type_name(ty: &syn::Type) -> Option<String> {
    match ty {
        syn::Type::Path(p) => p.path.segments.last().map(|s| s.ident.to_string()),
        syn::Type::Reference(r) => type_name(&r.elem),
        _ => None,
    }
}

/// Root names of a `use` tree, skipping `self`, `super`, and `crate`.
fn use_roots(tree: &syn::UseTree) -> Vec<String> {
    let keep = |name: String| -> Vec<String> {
        if matches!(name.as_str(), "self" | "super" | "crate") {
            vec![]
        } else {
            vec![name]
        }
    };
    match tree {
        syn::UseTree::Path(p) => keep(p.ident.to_string()),
        syn::UseTree::Name(n) => keep(n.ident.to_string()),
        syn::UseTree::Rename(r) => keep(r.ident.to_string()),
        syn::UseTree::Group(g) => g.items.iter().flat_map(use_roots).collect(),
        syn::UseTree::Glob(_) => vec![],
    }
}
