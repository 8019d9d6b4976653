//! Patch loader: a line-based text format for signal graphs.
//!
//! ```text
//! # comment
//! node <name> <kind> [args...]
//! connect <src> <outlet> <dst> <inlet>
//! feedback <src> <outlet> <dst> <inlet>
//! receive <target> <node> [<node>...]
//! ```
//!
//! Loading is two stages: [`Patch::parse`] checks each line on its own and
//! reports malformed input with its line number; [`Patch::to_graph`] resolves
//! names, builds the graph and validates its structure.

use crate::control::{Name, NameError};
use crate::dsl::{DslError, GraphBuilder};
use crate::graph::{Graph, GraphError};
use crate::invariant_ppt::{assert_invariant, PATCH_PIPELINE};
use crate::node::{KindError, NodeKind};
use crate::plan::PlanError;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

/// Why a line failed to parse.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseReason {
    /// The first token is not a directive.
    #[error("unknown directive `{0}`")]
    UnknownDirective(String),
    /// A required field is absent.
    #[error("`{directive}` is missing its {field}")]
    MissingField {
        /// Directive being parsed.
        directive: &'static str,
        /// Name of the absent field.
        field: &'static str,
    },
    /// Extra tokens after a complete directive.
    #[error("unexpected trailing `{0}`")]
    TrailingToken(String),
    /// Unknown node kind or bad creation argument.
    #[error(transparent)]
    Kind(#[from] KindError),
    /// Outlet or inlet index that is not a non-negative integer.
    #[error("bad port index `{0}`")]
    BadPort(String),
    /// A node name declared twice.
    #[error("node `{0}` is already declared")]
    DuplicateName(String),
    /// A node name that cannot be written back into a patch.
    #[error("bad node name `{0}`")]
    BadNodeName(String),
    /// A receiver name that cannot travel in a message.
    #[error("bad target name: {0}")]
    BadTargetName(#[from] NameError),
}

/// A malformed line.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("line {line}: {reason}")]
pub struct ParseError {
    /// 1-based line number.
    pub line: usize,
    /// What went wrong.
    pub reason: ParseReason,
}

/// A well-formed patch that does not describe a valid graph.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// A connection or receiver names a node that was never declared.
    #[error("line {line}: unknown node `{name}`")]
    UnknownName {
        /// 1-based line number.
        line: usize,
        /// The dangling name.
        name: String,
    },
    /// A connection the graph refused (bad port, duplicate edge).
    #[error("line {line}: {source}")]
    Connection {
        /// 1-based line number.
        line: usize,
        /// The graph's reason.
        source: GraphError,
    },
    /// The assembled graph failed validation.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// The graph does not fit the stream it is loaded into.
    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// Errors from [`load`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LoadError {
    /// Malformed source.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Structurally invalid graph.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// `node` directive.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDecl {
    /// Source line.
    pub line: usize,
    /// Patch-local name.
    pub name: String,
    /// Resolved kind.
    pub kind: NodeKind,
}

/// `connect` or `feedback` directive.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkDecl {
    /// Source line.
    pub line: usize,
    /// Source node name.
    pub src: String,
    /// Source outlet.
    pub outlet: usize,
    /// Destination node name.
    pub dst: String,
    /// Destination inlet.
    pub inlet: usize,
    /// Declared with `feedback`.
    pub feedback: bool,
}

/// `receive` directive.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveDecl {
    /// Source line.
    pub line: usize,
    /// Target name.
    pub target: String,
    /// Receiving node names.
    pub nodes: Vec<String>,
}

/// A parsed patch. Immutable once parsed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    /// Nodes in declaration order.
    pub nodes: Vec<NodeDecl>,
    /// Connections in declaration order.
    pub links: Vec<LinkDecl>,
    /// Receivers in declaration order.
    pub receives: Vec<ReceiveDecl>,
}

struct Fields<'a> {
    line: usize,
    directive: &'static str,
    tokens: std::str::SplitWhitespace<'a>,
}

impl<'a> Fields<'a> {
    fn next(&mut self, field: &'static str) -> Result<&'a str, ParseError> {
        self.tokens.next().ok_or(ParseError {
            line: self.line,
            reason: ParseReason::MissingField {
                directive: self.directive,
                field,
            },
        })
    }

    fn port(&mut self, field: &'static str) -> Result<usize, ParseError> {
        let token = self.next(field)?;
        token.parse().map_err(|_| ParseError {
            line: self.line,
            reason: ParseReason::BadPort(token.to_string()),
        })
    }

    fn finish(mut self) -> Result<(), ParseError> {
        match self.tokens.next() {
            Some(extra) => Err(ParseError {
                line: self.line,
                reason: ParseReason::TrailingToken(extra.to_string()),
            }),
            None => Ok(()),
        }
    }
}

impl Patch {
    /// Parse patch source in a single forward pass.
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let mut patch = Patch::default();
        let mut declared = HashSet::new();

        for (idx, raw) in source.lines().enumerate() {
            let line = idx + 1;
            let text = raw.split('#').next().unwrap_or("");
            let mut tokens = text.split_whitespace();
            let Some(directive) = tokens.next() else {
                continue;
            };
            let err = |reason| ParseError { line, reason };

            match directive {
                "node" => {
                    let mut fields = Fields {
                        line,
                        directive: "node",
                        tokens,
                    };
                    let name = fields.next("name")?;
                    let kind_name = fields.next("kind")?;
                    let args: Vec<&str> = fields.tokens.collect();
                    let kind = NodeKind::from_tokens(kind_name, &args).map_err(|e| err(e.into()))?;
                    if !declared.insert(name) {
                        return Err(err(ParseReason::DuplicateName(name.to_string())));
                    }
                    patch.nodes.push(NodeDecl {
                        line,
                        name: name.to_string(),
                        kind,
                    });
                }
                "connect" | "feedback" => {
                    let feedback = directive == "feedback";
                    let mut fields = Fields {
                        line,
                        directive: if feedback { "feedback" } else { "connect" },
                        tokens,
                    };
                    let src = fields.next("source node")?.to_string();
                    let outlet = fields.port("outlet")?;
                    let dst = fields.next("destination node")?.to_string();
                    let inlet = fields.port("inlet")?;
                    fields.finish()?;
                    patch.links.push(LinkDecl {
                        line,
                        src,
                        outlet,
                        dst,
                        inlet,
                        feedback,
                    });
                }
                "receive" => {
                    let mut fields = Fields {
                        line,
                        directive: "receive",
                        tokens,
                    };
                    let target = fields.next("target")?;
                    Name::new(target).map_err(|e| err(e.into()))?;
                    let first = fields.next("node")?;
                    let nodes = std::iter::once(first)
                        .chain(fields.tokens)
                        .map(str::to_string)
                        .collect();
                    patch.receives.push(ReceiveDecl {
                        line,
                        target: target.to_string(),
                        nodes,
                    });
                }
                other => return Err(err(ParseReason::UnknownDirective(other.to_string()))),
            }
        }
        Ok(patch)
    }

    /// Build and validate the graph this patch describes.
    pub fn to_graph(&self) -> Result<Graph, ValidationError> {
        let mut builder = GraphBuilder::new();
        for decl in &self.nodes {
            // Names are unique after parsing.
            builder
                .node_named(&decl.name, decl.kind.clone())
                .map_err(|e| dsl_error(decl.line, e))?;
        }
        for link in &self.links {
            let src = resolve(&builder, link.line, &link.src)?;
            let dst = resolve(&builder, link.line, &link.dst)?;
            let result = if link.feedback {
                builder.feedback(src, link.outlet, dst, link.inlet)
            } else {
                builder.connect(src, link.outlet, dst, link.inlet)
            };
            result.map_err(|e| dsl_error(link.line, e))?;
        }
        for receive in &self.receives {
            for name in &receive.nodes {
                let node = resolve(&builder, receive.line, name)?;
                builder
                    .receive(&receive.target, node)
                    .map_err(|e| dsl_error(receive.line, e))?;
            }
        }
        let graph = builder.build();
        graph.validate()?;
        Ok(graph)
    }
}

fn resolve(
    builder: &GraphBuilder,
    line: usize,
    name: &str,
) -> Result<crate::dsl::NodeHandle, ValidationError> {
    builder.lookup(name).map_err(|_| ValidationError::UnknownName {
        line,
        name: name.to_string(),
    })
}

fn dsl_error(line: usize, error: DslError) -> ValidationError {
    match error {
        DslError::Graph(source) => ValidationError::Connection { line, source },
        DslError::MissingNode(name) | DslError::DuplicateName(name) => {
            ValidationError::UnknownName { line, name }
        }
    }
}

/// Parse and validate patch source into a graph.
pub fn load(source: &str) -> Result<Graph, LoadError> {
    let patch = Patch::parse(source)?;
    let graph = patch.to_graph()?;
    assert_invariant(
        PATCH_PIPELINE,
        graph.node_count() == patch.nodes.len() && graph.validate().is_ok(),
        "loaded graph holds every declared node and passed validation",
        Some("patch::load"),
    );
    tracing::debug!(
        nodes = graph.node_count(),
        edges = graph.edges().len(),
        targets = graph.targets().len(),
        "patch loaded"
    );
    Ok(graph)
}

fn is_patch_token(text: &str) -> bool {
    !text.is_empty() && !text.contains('#') && !text.chars().any(char::is_whitespace)
}

fn is_generated_name(text: &str) -> bool {
    text.strip_prefix('n')
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

/// Write a graph as patch source. Labels are kept where they are unique and
/// writable; other nodes are named `n<id>`. Every kind parameter is written
/// out, so [`load`] yields a structurally equal graph.
pub fn serialize(graph: &Graph) -> String {
    let mut label_uses: HashMap<&str, usize> = HashMap::new();
    for node in graph.nodes() {
        if let Some(label) = node.label.as_deref() {
            *label_uses.entry(label).or_default() += 1;
        }
    }
    let names: Vec<String> = graph
        .nodes()
        .iter()
        .map(|node| match node.label.as_deref() {
            Some(label)
                if label_uses.get(label) == Some(&1)
                    && is_patch_token(label)
                    && !is_generated_name(label) =>
            {
                label.to_string()
            }
            _ => format!("n{}", node.id.0),
        })
        .collect();

    let mut out = String::new();
    for (node, name) in graph.nodes().iter().zip(&names) {
        let _ = writeln!(out, "node {} {}", name, node.kind);
    }
    for edge in graph.edges() {
        let _ = writeln!(
            out,
            "{} {} {} {} {}",
            if edge.feedback { "feedback" } else { "connect" },
            names[edge.from_node.0],
            edge.from_port.0,
            names[edge.to_node.0],
            edge.to_port.0
        );
    }
    for target in graph.targets() {
        let _ = write!(out, "receive {}", target.name);
        for id in &target.receivers {
            let _ = write!(out, " {}", names[id.0]);
        }
        out.push('\n');
    }
    out
}

/// Byte source for patch files, provided by the host.
pub trait PatchReader: Send {
    /// Read the patch at `path` as text.
    fn read(&self, path: &Path) -> io::Result<String>;
}

/// Reads patches from the filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsPatchReader;

impl PatchReader for FsPatchReader {
    fn read(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }
}

/// Serves patches from memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryPatchReader {
    files: HashMap<PathBuf, String>,
}

impl MemoryPatchReader {
    /// Create an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a patch.
    pub fn insert(&mut self, path: impl Into<PathBuf>, source: impl Into<String>) -> &mut Self {
        self.files.insert(path.into(), source.into());
        self
    }
}

impl PatchReader for MemoryPatchReader {
    fn read(&self, path: &Path) -> io::Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no patch at {}", path.display()),
            )
        })
    }
}
