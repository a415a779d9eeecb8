//! Streaming block parser. The copilot fences action payloads in triple
//! backtick code blocks; each fenced segment carries `// key: value` metadata
//! lines followed by a JSON body. The parser is pure and deterministic: it is
//! re-run against the full buffer on every incoming chunk, and a truncated
//! buffer can only ever produce `Text` or `StreamingAction` blocks, never a
//! finalized `Action`.

use std::collections::HashMap;

use crate::action::{ActionOp, ConfigType, CopilotAction, EXTERNAL_TRIGGER_EDIT_ERROR};
use crate::validator::{SchemaRegistry, Validation};

/// Metadata parsed so far from an incomplete action block. Only used to show
/// partial names in the UI, never for commitment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialAction {
    pub op: Option<ActionOp>,
    pub config_type: Option<ConfigType>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Text { content: String },
    StreamingAction { action: PartialAction },
    Action { action: CopilotAction },
}

/// Parse the full assistant turn so far into an ordered block sequence.
pub fn parse_blocks(text: &str, registry: &dyn SchemaRegistry) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find("```") {
        let before = &rest[..open];
        if !before.trim().is_empty() {
            blocks.push(Block::Text {
                content: before.to_owned(),
            });
        }

        // Skip the fence marker and its language tag line.
        let after_marker = &rest[open + 3..];
        let body_start = after_marker
            .find('\n')
            .map(|i| i + 1)
            .unwrap_or(after_marker.len());
        let body = &after_marker[body_start..];

        match body.find("```") {
            Some(close) => {
                blocks.push(enrich(&body[..close], true, registry));
                // Anything after the closing marker, same line included,
                // belongs to the next text run.
                rest = &body[close + 3..];
            }
            None => {
                // Unterminated fence: the block is still streaming in and
                // must not finalize no matter how complete it looks.
                blocks.push(enrich(body, false, registry));
                rest = "";
            }
        }
    }

    if !rest.trim().is_empty() {
        blocks.push(Block::Text {
            content: rest.to_owned(),
        });
    }

    blocks
}

/// Turn one fenced segment into a typed block. Only a closed fence
/// (`complete`) may produce a finalized action.
fn enrich(content: &str, complete: bool, registry: &dyn SchemaRegistry) -> Block {
    let trimmed = content.trim();
    if !trimmed.starts_with("//") {
        return Block::Text {
            content: content.to_owned(),
        };
    }

    let mut metadata: HashMap<&str, &str> = HashMap::new();
    let mut json_lines: Vec<&str> = Vec::new();
    let mut in_header = true;
    for line in trimmed.lines() {
        let line = line.trim();
        if in_header && line.starts_with("//") {
            if let Some((key, value)) = line[2..].split_once(':') {
                let (key, value) = (key.trim(), value.trim());
                if !key.is_empty() && !value.is_empty() {
                    metadata.insert(key, value);
                }
            }
        } else {
            in_header = false;
            json_lines.push(line);
        }
    }

    let partial = PartialAction {
        op: metadata.get("action").and_then(|s| s.parse().ok()),
        config_type: metadata.get("config_type").and_then(|s| s.parse().ok()),
        name: metadata.get("name").map(|s| (*s).to_owned()),
    };
    if !complete {
        return Block::StreamingAction { action: partial };
    }

    let payload: serde_json::Value = match serde_json::from_str(&json_lines.join("\n")) {
        Ok(value) => value,
        // JSON incomplete: the block is still streaming.
        Err(_) => return Block::StreamingAction { action: partial },
    };

    let (Some(op), Some(config_type), Some(name)) =
        (partial.op, partial.config_type, partial.name.clone())
    else {
        return Block::StreamingAction { action: partial };
    };

    let change_description = payload
        .get("change_description")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_owned();

    if config_type == ConfigType::ExternalTrigger && op == ActionOp::Edit {
        return Block::Action {
            action: CopilotAction {
                op,
                config_type,
                name,
                change_description,
                config_changes: serde_json::Map::new(),
                error: Some(EXTERNAL_TRIGGER_EDIT_ERROR.to_owned()),
            },
        };
    }

    let raw_changes = match payload.get("config_changes") {
        Some(serde_json::Value::Object(map)) => map.clone(),
        _ => serde_json::Map::new(),
    };

    let action = match registry.validate(config_type, &raw_changes, &name) {
        Validation::Valid { changes } => CopilotAction {
            op,
            config_type,
            name,
            change_description,
            config_changes: changes,
            error: None,
        },
        Validation::Invalid { error } => CopilotAction {
            op,
            config_type,
            name,
            change_description,
            config_changes: serde_json::Map::new(),
            error: Some(error),
        },
    };

    Block::Action { action }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::WorkflowSchemaRegistry;

    const REGISTRY: WorkflowSchemaRegistry = WorkflowSchemaRegistry;

    const ACTION_BLOCK: &str = r#"Here is the change:

```copilot_change
// action: create_new
// config_type: agent
// name: Router
{"change_description": "Add a router", "config_changes": {"instructions": "Route requests"}}
```

Done."#;

    #[test]
    fn parses_text_action_text() {
        let blocks = parse_blocks(ACTION_BLOCK, &REGISTRY);
        assert_eq!(blocks.len(), 3);
        assert!(matches!(&blocks[0], Block::Text { content } if content.contains("Here is")));
        match &blocks[1] {
            Block::Action { action } => {
                assert_eq!(action.op, ActionOp::CreateNew);
                assert_eq!(action.config_type, ConfigType::Agent);
                assert_eq!(action.name, "Router");
                assert_eq!(action.change_description, "Add a router");
                assert_eq!(action.config_changes["instructions"], "Route requests");
                assert!(action.error.is_none());
            }
            other => panic!("expected action block, got {other:?}"),
        }
        assert!(matches!(&blocks[2], Block::Text { content } if content.contains("Done")));
    }

    #[test]
    fn reparsing_is_deterministic() {
        let first = parse_blocks(ACTION_BLOCK, &REGISTRY);
        for _ in 0..5 {
            assert_eq!(parse_blocks(ACTION_BLOCK, &REGISTRY), first);
        }
    }

    #[test]
    fn truncated_prefix_never_finalizes() {
        for end in 0..ACTION_BLOCK.len() - 10 {
            let blocks = parse_blocks(&ACTION_BLOCK[..end], &REGISTRY);
            assert!(
                !blocks.iter().any(|b| matches!(b, Block::Action { .. })),
                "finalized action from truncated prefix of length {end}"
            );
        }
    }

    #[test]
    fn incomplete_json_yields_streaming_action_with_metadata() {
        let text = "```\n// action: edit\n// config_type: tool\n// name: fetch_page\n{\"config_chan";
        let blocks = parse_blocks(text, &REGISTRY);
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            Block::StreamingAction { action } => {
                assert_eq!(action.op, Some(ActionOp::Edit));
                assert_eq!(action.config_type, Some(ConfigType::Tool));
                assert_eq!(action.name.as_deref(), Some("fetch_page"));
            }
            other => panic!("expected streaming action, got {other:?}"),
        }
    }

    #[test]
    fn missing_metadata_yields_streaming_action() {
        let text = "```\n// action: create_new\n{\"config_changes\": {}}\n```";
        let blocks = parse_blocks(text, &REGISTRY);
        assert!(matches!(&blocks[0], Block::StreamingAction { .. }));
    }

    #[test]
    fn external_trigger_edit_is_rejected_with_fixed_error() {
        let text = "```\n// action: edit\n// config_type: external_trigger\n// name: New email\n{\"config_changes\": {}}\n```";
        let blocks = parse_blocks(text, &REGISTRY);
        match &blocks[0] {
            Block::Action { action } => {
                assert_eq!(action.error.as_deref(), Some(EXTERNAL_TRIGGER_EDIT_ERROR));
                assert!(action.config_changes.is_empty());
            }
            other => panic!("expected action block, got {other:?}"),
        }
    }

    #[test]
    fn text_on_the_closing_fence_line_is_kept() {
        let text = "```\n// action: delete\n// config_type: agent\n// name: Router\n{}\n```Right after the fence.";
        let blocks = parse_blocks(text, &REGISTRY);
        assert_eq!(blocks.len(), 2);
        assert!(matches!(&blocks[0], Block::Action { .. }));
        assert!(
            matches!(&blocks[1], Block::Text { content } if content.contains("Right after the fence."))
        );
    }

    #[test]
    fn fenced_block_without_comment_header_is_text() {
        let text = "```\nlet x = 1;\n```";
        let blocks = parse_blocks(text, &REGISTRY);
        assert!(matches!(&blocks[0], Block::Text { content } if content.contains("let x")));
    }

    #[test]
    fn invalid_fields_are_dropped_by_validation() {
        let text = "```\n// action: edit\n// config_type: agent\n// name: Router\n{\"config_changes\": {\"disabled\": \"nope\", \"model\": \"gpt-4.1\"}}\n```";
        let blocks = parse_blocks(text, &REGISTRY);
        match &blocks[0] {
            Block::Action { action } => {
                assert!(action.error.is_none());
                assert!(!action.config_changes.contains_key("disabled"));
                assert_eq!(action.config_changes["model"], "gpt-4.1");
            }
            other => panic!("expected action block, got {other:?}"),
        }
    }
}
