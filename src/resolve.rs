//! Descriptor Dependency Resolution
//!
//! Expands compiled root descriptors into their full import closure. The walk
//! is depth-first and post-order, so every dependency is emitted before the
//! first file that imports it, and each name is emitted once.
//!
//! The accumulated state is an owned [`Closure`] passed into and returned from
//! every step.

use std::collections::{HashMap, HashSet};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use prost::Message;
use tracing::{debug, info};

use crate::checksum::Checksum;
use crate::error::{CodegenError, Result};
use crate::protocol::{CodeGeneratorRequest, FileDescriptorProto, FileDescriptorSet};

/// Anything that can compile schema files into descriptors
pub trait DescriptorSource {
    /// Whether `name` can be compiled at all
    fn locate(&self, name: &str) -> bool;

    /// Compile the named files in one invocation
    fn compile(&mut self, names: &[String]) -> Result<FileDescriptorSet>;
}

/// Resolver accumulator
#[derive(Debug, Clone, Default)]
pub struct Closure {
    visited: HashSet<String>,
    in_progress: HashSet<String>,
    files: Vec<FileDescriptorProto>,
}

impl Closure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.visited.contains(name)
    }

    /// Emitted descriptors, dependencies first
    pub fn files(&self) -> &[FileDescriptorProto] {
        &self.files
    }

    pub fn into_files(self) -> Vec<FileDescriptorProto> {
        self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Resolve every descriptor in `set`, compiling missing dependencies through `source`
pub fn resolve<S>(source: &mut S, set: FileDescriptorSet, mut closure: Closure) -> Result<Closure>
where
    S: DescriptorSource + ?Sized,
{
    for file in set.file {
        let name = file.name().to_string();
        if closure.visited.contains(&name) {
            continue;
        }
        closure.in_progress.insert(name.clone());

        for dependency in &file.dependency {
            if closure.visited.contains(dependency) {
                continue;
            }
            if closure.in_progress.contains(dependency) {
                return Err(CodegenError::DependencyCycle {
                    name: dependency.clone(),
                });
            }
            if !source.locate(dependency) {
                return Err(CodegenError::UnresolvedDependency {
                    name: dependency.clone(),
                    referenced_by: name,
                });
            }

            debug!(dependency = %dependency, referenced_by = %name, "compiling dependency");
            let compiled = source.compile(std::slice::from_ref(dependency))?;
            closure = resolve(source, compiled, closure)?;
            closure.visited.insert(dependency.clone());
        }

        closure.in_progress.remove(&name);
        if closure.visited.insert(name) {
            closure.files.push(file);
        }
    }
    Ok(closure)
}

// =============================================================================
// Compilation Request
// =============================================================================

/// Ordered, duplicate-free descriptor closure plus the roots it was built from
#[derive(Debug, Clone, PartialEq)]
pub struct CompilationRequest {
    files: Vec<FileDescriptorProto>,
    roots: Vec<String>,
}

impl CompilationRequest {
    /// Compile `roots` in one batch and resolve their closure
    pub fn build<S>(source: &mut S, roots: &[String]) -> Result<Self>
    where
        S: DescriptorSource + ?Sized,
    {
        if roots.is_empty() {
            return Err(CodegenError::InvalidRequest("no root files to compile".to_string()));
        }

        let compiled = source.compile(roots)?;
        let closure = resolve(source, compiled, Closure::new())?;

        for root in roots {
            if !closure.contains(root) {
                return Err(CodegenError::InvalidRequest(format!(
                    "compiler returned no descriptor for root '{}'",
                    root
                )));
            }
        }

        let request = Self::from_parts(closure.into_files(), roots.to_vec());
        request.verify_order()?;
        info!(roots = roots.len(), files = request.files.len(), "resolved compilation request");
        Ok(request)
    }

    /// Assemble a request without checking it
    pub fn from_parts(files: Vec<FileDescriptorProto>, roots: Vec<String>) -> Self {
        Self { files, roots }
    }

    pub fn files(&self) -> &[FileDescriptorProto] {
        &self.files
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// Descriptor names in request order
    pub fn names(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.name()).collect()
    }

    pub fn is_root(&self, name: &str) -> bool {
        self.roots.iter().any(|r| r == name)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Plugin-protocol request handed to every generator
    pub fn to_generator_request(&self) -> CodeGeneratorRequest {
        CodeGeneratorRequest {
            file_to_generate: self.roots.clone(),
            parameter: None,
            proto_file: self.files.clone(),
            source_file_descriptors: self.files.clone(),
            compiler_version: None,
        }
    }

    /// The full closure as a descriptor set
    pub fn descriptor_set(&self) -> FileDescriptorSet {
        FileDescriptorSet {
            file: self.files.clone(),
        }
    }

    /// Digest of the encoded closure
    pub fn checksum(&self) -> Checksum {
        Checksum::from_bytes(&self.descriptor_set().encode_to_vec())
    }

    /// Graph with an edge from each dependency to every file importing it
    pub fn dependency_graph(&self) -> DiGraph<String, ()> {
        let mut graph = DiGraph::with_capacity(self.files.len(), self.files.len() * 2);
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::with_capacity(self.files.len());

        for file in &self.files {
            nodes
                .entry(file.name())
                .or_insert_with(|| graph.add_node(file.name().to_string()));
        }
        for file in &self.files {
            let dependent = nodes[file.name()];
            for dependency in &file.dependency {
                let node = *nodes
                    .entry(dependency.as_str())
                    .or_insert_with(|| graph.add_node(dependency.clone()));
                graph.add_edge(node, dependent, ());
            }
        }
        graph
    }

    /// Check that names are unique and every dependency comes earlier
    pub fn verify_order(&self) -> Result<()> {
        let mut position: HashMap<&str, usize> = HashMap::with_capacity(self.files.len());
        for (index, file) in self.files.iter().enumerate() {
            if position.insert(file.name(), index).is_some() {
                return Err(CodegenError::InvalidRequest(format!(
                    "descriptor '{}' appears more than once",
                    file.name()
                )));
            }
        }

        for (index, file) in self.files.iter().enumerate() {
            for dependency in &file.dependency {
                match position.get(dependency.as_str()) {
                    None => {
                        return Err(CodegenError::InvalidRequest(format!(
                            "'{}' imports '{}' which is not part of the request",
                            file.name(),
                            dependency
                        )))
                    }
                    Some(&at) if at >= index => {
                        return Err(CodegenError::InvalidRequest(format!(
                            "'{}' is ordered before its dependency '{}'",
                            file.name(),
                            dependency
                        )))
                    }
                    Some(_) => {}
                }
            }
        }

        if is_cyclic_directed(&self.dependency_graph()) {
            return Err(CodegenError::InvalidRequest(
                "dependency graph contains a cycle".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, deps: &[&str]) -> FileDescriptorProto {
        FileDescriptorProto {
            name: Some(name.to_string()),
            dependency: deps.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    /// In-memory compiler over a fixed descriptor table
    struct TableSource {
        table: HashMap<String, FileDescriptorProto>,
        calls: Vec<Vec<String>>,
    }

    impl TableSource {
        fn new(files: &[FileDescriptorProto]) -> Self {
            Self {
                table: files.iter().map(|f| (f.name().to_string(), f.clone())).collect(),
                calls: Vec::new(),
            }
        }
    }

    impl DescriptorSource for TableSource {
        fn locate(&self, name: &str) -> bool {
            self.table.contains_key(name)
        }

        fn compile(&mut self, names: &[String]) -> Result<FileDescriptorSet> {
            self.calls.push(names.to_vec());
            Ok(FileDescriptorSet {
                file: names.iter().map(|n| self.table[n].clone()).collect(),
            })
        }
    }

    #[test]
    fn test_dependencies_come_first() {
        let mut source = TableSource::new(&[
            descriptor("order.proto", &["common/money.proto"]),
            descriptor("common/money.proto", &[]),
        ]);

        let request = CompilationRequest::build(&mut source, &["order.proto".to_string()]).unwrap();
        assert_eq!(request.names(), vec!["common/money.proto", "order.proto"]);
        assert!(request.is_root("order.proto"));
        assert!(!request.is_root("common/money.proto"));
    }

    #[test]
    fn test_diamond_is_deduplicated() {
        let mut source = TableSource::new(&[
            descriptor("a.proto", &["b.proto", "c.proto"]),
            descriptor("b.proto", &["d.proto"]),
            descriptor("c.proto", &["d.proto"]),
            descriptor("d.proto", &[]),
        ]);

        let request = CompilationRequest::build(&mut source, &["a.proto".to_string()]).unwrap();
        assert_eq!(request.names(), vec!["d.proto", "b.proto", "c.proto", "a.proto"]);
        // d is compiled once, then served from the closure
        let d_calls = source.calls.iter().filter(|c| c[0] == "d.proto").count();
        assert_eq!(d_calls, 1);
    }

    #[test]
    fn test_roots_compiled_in_one_batch() {
        let mut source = TableSource::new(&[
            descriptor("a.proto", &["b.proto"]),
            descriptor("b.proto", &[]),
        ]);
        let roots = vec!["a.proto".to_string(), "b.proto".to_string()];

        let request = CompilationRequest::build(&mut source, &roots).unwrap();
        assert_eq!(source.calls[0], roots);
        assert_eq!(request.names(), vec!["b.proto", "a.proto"]);
        assert_eq!(request.roots(), roots.as_slice());
    }

    #[test]
    fn test_missing_dependency_names_both_files() {
        let mut source = TableSource::new(&[descriptor("order.proto", &["gone.proto"])]);

        let err = CompilationRequest::build(&mut source, &["order.proto".to_string()]).unwrap_err();
        match err {
            CodegenError::UnresolvedDependency { name, referenced_by } => {
                assert_eq!(name, "gone.proto");
                assert_eq!(referenced_by, "order.proto");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut source = TableSource::new(&[
            descriptor("a.proto", &["b.proto"]),
            descriptor("b.proto", &["a.proto"]),
        ]);

        let err = CompilationRequest::build(&mut source, &["a.proto".to_string()]).unwrap_err();
        assert!(matches!(err, CodegenError::DependencyCycle { name } if name == "a.proto"));
    }

    #[test]
    fn test_resolve_threads_closure() {
        let mut source = TableSource::new(&[descriptor("b.proto", &[])]);
        let first = resolve(
            &mut source,
            FileDescriptorSet {
                file: vec![descriptor("a.proto", &["b.proto"])],
            },
            Closure::new(),
        )
        .unwrap();
        assert_eq!(first.len(), 2);

        // Feeding the same set again adds nothing
        let second = resolve(
            &mut source,
            FileDescriptorSet {
                file: vec![descriptor("a.proto", &["b.proto"])],
            },
            first.clone(),
        )
        .unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(source.calls.len(), 1);
    }

    #[test]
    fn test_verify_order_rejects_bad_requests() {
        let out_of_order = CompilationRequest::from_parts(
            vec![descriptor("a.proto", &["b.proto"]), descriptor("b.proto", &[])],
            vec!["a.proto".to_string()],
        );
        assert!(out_of_order.verify_order().is_err());

        let duplicate = CompilationRequest::from_parts(
            vec![descriptor("a.proto", &[]), descriptor("a.proto", &[])],
            vec!["a.proto".to_string()],
        );
        assert!(duplicate.verify_order().is_err());
    }

    #[test]
    fn test_generator_request_and_graph() {
        let request = CompilationRequest::from_parts(
            vec![descriptor("b.proto", &[]), descriptor("a.proto", &["b.proto"])],
            vec!["a.proto".to_string()],
        );
        let generator_request = request.to_generator_request();
        assert_eq!(generator_request.file_to_generate, vec!["a.proto"]);
        assert_eq!(generator_request.proto_file.len(), 2);
        assert_eq!(generator_request.source_file_descriptors, generator_request.proto_file);

        let graph = request.dependency_graph();
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(request.checksum(), request.clone().checksum());
    }
}
