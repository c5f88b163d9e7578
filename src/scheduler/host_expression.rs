use crate::error::{Error, Result};
use crate::model::node::NodeSet;
use crate::platform::Platform;
use log::debug;
use regex::Regex;

const CLASS_PREFIX: &str = "CLASS:";
const RANGE_PREFIX: &str = "R:";
const REGEX_METACHARS: &[char] = &['*', '+', '?', '^', '$', '|', '(', ')', '\\', '{', '}'];

/// Selection of hosts by name, name range, class or regular expression.
#[derive(Debug, Clone)]
pub enum HostExpression {
    /// Comma separated host names.
    List(Vec<Box<str>>),
    /// Host names generated out of `R:prefix[01-04,07]suffix`.
    Range(Vec<Box<str>>),
    /// Every node carrying the class.
    Class(Box<str>),
    Regex(Regex),
}

impl HostExpression {
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        let invalid = |reason: &str| Error::HostExpressionInvalid {
            expression: expression.into(),
            reason: reason.to_string(),
        };
        if expression.is_empty() {
            return Err(invalid("empty expression"));
        }
        if let Some(class) = expression.strip_prefix(CLASS_PREFIX) {
            if class.is_empty() {
                return Err(invalid("missing class name"));
            }
            return Ok(HostExpression::Class(class.into()));
        }
        if let Some(ranges) = expression.strip_prefix(RANGE_PREFIX) {
            let mut names = Vec::new();
            for part in split_outside_brackets(ranges) {
                names.extend(expand_range(part).map_err(|reason| invalid(&reason))?);
            }
            return Ok(HostExpression::Range(names));
        }
        if expression.contains(REGEX_METACHARS) || expression.contains(".*") {
            let regex = Regex::new(&format!("^(?:{})$", expression)).map_err(|e| invalid(&e.to_string()))?;
            return Ok(HostExpression::Regex(regex));
        }
        let names: Vec<Box<str>> = expression
            .split([',', ' ', ':'])
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(Box::from)
            .collect();
        Ok(HostExpression::List(names))
    }

    /// Resolves the expression against the platform nodes. Duplicate hosts are collapsed.
    /// `limit` caps the number of nodes retained, in node index order.
    pub fn expand(&self, platform: &Platform, expression: &str, limit: Option<u32>) -> Result<NodeSet> {
        let mut nodes = NodeSet::new();
        match self {
            HostExpression::List(names) | HostExpression::Range(names) => {
                for name in names {
                    let Some(node) = platform.node_by_name(name) else {
                        return Err(Error::HostExpressionInvalid {
                            expression: expression.into(),
                            reason: format!("cannot locate host '{}'", name),
                        });
                    };
                    nodes.insert(node.id);
                }
            }
            HostExpression::Class(class) => {
                nodes.extend(platform.nodes().iter().filter(|n| n.has_class(class)).map(|n| n.id));
            }
            HostExpression::Regex(regex) => {
                nodes.extend(platform.nodes().iter().filter(|n| regex.is_match(&n.name)).map(|n| n.id));
            }
        }
        if let Some(limit) = limit {
            nodes = nodes.iter().take(limit as usize).collect();
        }
        if nodes.is_empty() {
            return Err(Error::HostExpressionInvalid {
                expression: expression.into(),
                reason: "no host matches".to_string(),
            });
        }
        debug!("Host expression '{}' expanded to {} nodes", expression, nodes.len());
        Ok(nodes)
    }
}

/// Parses and resolves `expression` in one go.
pub fn expand_host_expression(platform: &Platform, expression: &str, limit: Option<u32>) -> Result<NodeSet> {
    HostExpression::parse(expression)?.expand(platform, expression, limit)
}

fn split_outside_brackets(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut begin = 0;
    for (i, c) in input.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&input[begin..i]);
                begin = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[begin..]);
    parts.into_iter().map(str::trim).filter(|p| !p.is_empty()).collect()
}

/// Expands `node[01-03,07]x` into `node01x, node02x, node03x, node07x`. Bounds keep their zero padding.
fn expand_range(part: &str) -> std::result::Result<Vec<Box<str>>, String> {
    let Some(open) = part.find('[') else {
        return Ok(vec![part.into()]);
    };
    let close = part[open..].find(']').map(|i| open + i).ok_or_else(|| format!("unbalanced bracket in '{}'", part))?;
    let (prefix, body, suffix) = (&part[..open], &part[open + 1..close], &part[close + 1..]);
    let mut names = Vec::new();
    for item in body.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (low, high) = item.split_once('-').unwrap_or((item, item));
        let width = low.len();
        let low: u64 = low.parse().map_err(|_| format!("invalid range bound '{}'", low))?;
        let high: u64 = high.parse().map_err(|_| format!("invalid range bound '{}'", high))?;
        if low > high {
            return Err(format!("empty range '{}'", item));
        }
        for index in low..=high {
            names.push(format!("{}{:0width$}{}", prefix, index, suffix, width = width).into());
        }
    }
    if names.is_empty() {
        return Err(format!("empty range in '{}'", part));
    }
    Ok(names)
}
