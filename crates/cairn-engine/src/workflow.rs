use std::fmt;

use cairn_domain::TypeName;
use cairn_lang::{Directive, Node};

use crate::error::EvalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageAction {
    Create,
    Delete,
}

impl StageAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for StageAction {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub name: String,
    pub action: StageAction,
    pub description: Option<String>,
}

/// Ordered stages that replace a resource whose identity-bearing fields
/// changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workflow {
    pub name: String,
    pub for_type: TypeName,
    pub stages: Vec<Stage>,
}

impl Workflow {
    #[must_use]
    pub fn new(name: impl Into<String>, for_type: TypeName) -> Self {
        Self {
            name: name.into(),
            for_type,
            stages: Vec::new(),
        }
    }

    #[must_use]
    pub fn stage(mut self, name: impl Into<String>, action: StageAction) -> Self {
        self.stages.push(Stage {
            name: name.into(),
            action,
            description: None,
        });
        self
    }

    /// Build a workflow from `@workflow 'name' -for-type 'ns::kind'` and its
    /// `@stage:` lines. Only literal arguments are accepted.
    pub(crate) fn from_directive(directive: &Directive) -> Result<Self, EvalError> {
        let invalid = |message: &str| EvalError::InvalidDirective {
            span: directive.span.clone(),
            name: directive.name.clone(),
            message: message.to_string(),
        };

        let name = literal_argument(&directive.arguments)
            .ok_or_else(|| invalid("expects a literal workflow name"))?;
        let for_type = directive
            .option("for-type")
            .and_then(|option| literal_argument(&option.arguments))
            .ok_or_else(|| invalid("expects `-for-type 'namespace::kind'`"))?;
        let for_type =
            TypeName::try_from(for_type).map_err(|source| EvalError::InvalidIdentity {
                span: directive.span.clone(),
                source,
            })?;

        let mut workflow = Self::new(name, for_type);
        for node in &directive.body {
            let Node::Directive(stage) = node else {
                return Err(invalid("may only contain `@stage:` lines"));
            };
            if stage.name != "stage" {
                return Err(invalid("may only contain `@stage:` lines"));
            }
            workflow.stages.push(parse_stage(stage)?);
        }
        if workflow.stages.is_empty() {
            return Err(invalid("needs at least one stage"));
        }
        Ok(workflow)
    }
}

fn parse_stage(directive: &Directive) -> Result<Stage, EvalError> {
    let invalid = |message: &str| EvalError::InvalidDirective {
        span: directive.span.clone(),
        name: directive.name.clone(),
        message: message.to_string(),
    };

    let name = literal_argument(&directive.arguments)
        .ok_or_else(|| invalid("expects a literal stage name"))?;
    let action = match directive
        .option("action")
        .and_then(|option| literal_argument(&option.arguments))
    {
        Some("create") => StageAction::Create,
        Some("delete") => StageAction::Delete,
        _ => return Err(invalid("expects `-action 'create'` or `-action 'delete'`")),
    };
    let description = directive
        .option("description")
        .and_then(|option| literal_argument(&option.arguments))
        .map(str::to_string);

    Ok(Stage {
        name: name.to_string(),
        action,
        description,
    })
}

fn literal_argument(arguments: &[Node]) -> Option<&str> {
    arguments.first().and_then(Node::as_string_literal)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::panic)]

    use std::path::Path;

    use cairn_lang::{Node, parse};

    use super::{StageAction, Workflow};
    use crate::error::EvalError;

    fn first_directive(source: &str) -> cairn_lang::Directive {
        let file = parse(source, Path::new("workflows.cairn")).expect("source parses");
        match file.body.into_iter().next() {
            Some(Node::Directive(directive)) => directive,
            other => panic!("expected a directive, got {other:?}"),
        }
    }

    #[test]
    fn reads_stages_in_order() {
        let directive = first_directive(
            "@workflow 'swap' -for-type 'local::file'\n  @stage: 'remove' -action 'delete' -description 'drop the old file'\n  @stage: 'write' -action 'create'\n@end\n",
        );
        let workflow = Workflow::from_directive(&directive).expect("workflow is valid");

        assert_eq!(workflow.name, "swap");
        assert_eq!(workflow.for_type.as_str(), "local::file");
        let actions: Vec<_> = workflow.stages.iter().map(|stage| stage.action).collect();
        assert_eq!(actions, vec![StageAction::Delete, StageAction::Create]);
        assert_eq!(
            workflow.stages[0].description.as_deref(),
            Some("drop the old file")
        );
    }

    #[test]
    fn rejects_unknown_stage_action() {
        let directive = first_directive(
            "@workflow 'swap' -for-type 'local::file'\n  @stage: 'x' -action 'move'\n@end\n",
        );
        let error = Workflow::from_directive(&directive).expect_err("action is invalid");
        assert!(matches!(error, EvalError::InvalidDirective { .. }));
    }
}
