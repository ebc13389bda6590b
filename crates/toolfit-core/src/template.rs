//! Chat templates and stop sequences per architecture.
//!
//! Each body is an Ollama Go template with two shapes:
//!
//! - **Conversation** (`{{ if .Messages }}`): system preamble, then one block
//!   per role-tagged turn, then the assistant header.
//! - **Single prompt** (`{{ else }}`): flat `.System` + `.Prompt`.
//!
//! Referencing `.Tools` is what makes the runtime advertise tool calling.
//! The catalog is immutable; adding an architecture means adding a variant
//! and one entry in [`template_for`].

use serde::Serialize;

use crate::architecture::Architecture;

/// Bumped whenever a template body or stop list changes.
pub const CATALOG_VERSION: u32 = 1;

/// The two rendering shapes a template body supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateShape {
    Conversation,
    SinglePrompt,
}

/// Template body and stop tokens for one architecture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelTemplate {
    pub architecture: Architecture,
    pub body: &'static str,
    /// Order is preserved in the generated Modelfile.
    pub stop_sequences: &'static [&'static str],
}

impl ModelTemplate {
    /// Whether the body has a branch for `shape`.
    pub fn supports(&self, shape: TemplateShape) -> bool {
        match shape {
            TemplateShape::Conversation => self.body.contains("{{ if .Messages }}"),
            TemplateShape::SinglePrompt => {
                self.body.contains("{{- else }}") && self.body.contains("{{ .Prompt }}")
            }
        }
    }

    /// Whether the body references `.Tools`.
    pub fn is_tool_capable(&self) -> bool {
        self.body.contains(".Tools")
    }
}

static LLAMA3: ModelTemplate = ModelTemplate {
    architecture: Architecture::Llama3,
    body: r#"{{ if .Messages }}
{{- if or .System .Tools }}<|start_header_id|>system<|end_header_id|>
{{- if .System }}

{{ .System }}
{{- end }}
{{- if .Tools }}

You are a helpful assistant with tool calling capabilities. When you receive a tool call response, use the output to format an answer to the original user question.
{{- end }}<|eot_id|>
{{- end }}
{{- range .Messages }}
<|start_header_id|>{{ .Role }}<|end_header_id|>

{{ .Content }}<|eot_id|>
{{- end }}
<|start_header_id|>assistant<|end_header_id|>

{{- else }}
<|start_header_id|>system<|end_header_id|>

{{ .System }}<|eot_id|>
<|start_header_id|>user<|end_header_id|>

{{ .Prompt }}<|eot_id|>
<|start_header_id|>assistant<|end_header_id|>
{{- end }}"#,
    stop_sequences: &["<|start_header_id|>", "<|end_header_id|>", "<|eot_id|>"],
};

static MISTRAL: ModelTemplate = ModelTemplate {
    architecture: Architecture::Mistral,
    body: r#"{{ if .Messages }}
{{- if or .System .Tools }}[INST]
{{- if .System }}{{ .System }}
{{- end }}
{{- if .Tools }}

You are a helpful assistant with tool calling capabilities. When you receive a tool call response, use the output to format an answer to the original user question.
{{- end }}[/INST]
{{- end }}
{{- range .Messages }}
{{- if eq .Role "user" }}[INST] {{ .Content }} [/INST]
{{- else if eq .Role "assistant" }}{{ .Content }}</s>
{{- end }}
{{- end }}
{{- else }}[INST] {{ if .System }}{{ .System }}

{{ end }}{{ .Prompt }} [/INST]
{{- end }}"#,
    stop_sequences: &["</s>", "[INST]", "[/INST]"],
};

static PHI3: ModelTemplate = ModelTemplate {
    architecture: Architecture::Phi3,
    body: r#"{{ if .Messages }}
{{- if or .System .Tools }}<|system|>
{{- if .System }}{{ .System }}
{{- end }}
{{- if .Tools }}

You are a helpful assistant with tool calling capabilities. When you receive a tool call response, use the output to format an answer to the original user question.
{{- end }}<|end|>
{{- end }}
{{- range .Messages }}
<|{{ .Role }}|>
{{ .Content }}<|end|>
{{- end }}
<|assistant|>
{{- else }}<|system|>
{{ .System }}<|end|>
<|user|>
{{ .Prompt }}<|end|>
<|assistant|>
{{- end }}"#,
    stop_sequences: &["<|end|>", "<|system|>", "<|user|>", "<|assistant|>"],
};

static GEMMA2: ModelTemplate = ModelTemplate {
    architecture: Architecture::Gemma2,
    body: r#"{{ if .Messages }}
{{- if or .System .Tools }}<start_of_turn>user
{{- if .System }}
{{ .System }}
{{- end }}
{{- if .Tools }}

You are a helpful assistant with tool calling capabilities. When you receive a tool call response, use the output to format an answer to the original user question.
{{- end }}<end_of_turn>
{{- end }}
{{- range .Messages }}
<start_of_turn>{{ if eq .Role "assistant" }}model{{ else }}{{ .Role }}{{ end }}
{{ .Content }}<end_of_turn>
{{- end }}
<start_of_turn>model
{{- else }}<start_of_turn>user
{{ if .System }}{{ .System }}

{{ end }}{{ .Prompt }}<end_of_turn>
<start_of_turn>model
{{- end }}"#,
    stop_sequences: &["<end_of_turn>", "<start_of_turn>"],
};

static QWEN: ModelTemplate = ModelTemplate {
    architecture: Architecture::Qwen,
    body: r#"{{ if .Messages }}
{{- if or .System .Tools }}<|im_start|>system
{{- if .System }}
{{ .System }}
{{- end }}
{{- if .Tools }}

You are a helpful assistant with tool calling capabilities. When you receive a tool call response, use the output to format an answer to the original user question.
{{- end }}<|im_end|>
{{- end }}
{{- range .Messages }}
<|im_start|>{{ .Role }}
{{ .Content }}<|im_end|>
{{- end }}
<|im_start|>assistant
{{- else }}<|im_start|>system
{{ .System }}<|im_end|>
<|im_start|>user
{{ .Prompt }}<|im_end|>
<|im_start|>assistant
{{- end }}"#,
    stop_sequences: &["<|im_start|>", "<|im_end|>"],
};

/// Look up the template for an architecture.
pub fn template_for(architecture: Architecture) -> &'static ModelTemplate {
    match architecture {
        Architecture::Llama3 => &LLAMA3,
        Architecture::Mistral => &MISTRAL,
        Architecture::Phi3 => &PHI3,
        Architecture::Gemma2 => &GEMMA2,
        Architecture::Qwen => &QWEN,
    }
}

/// Every catalog entry, in [`Architecture::ALL`] order.
pub fn all_templates() -> impl Iterator<Item = &'static ModelTemplate> {
    Architecture::ALL.into_iter().map(template_for)
}
