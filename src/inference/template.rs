//! Chat templates
//!
//! Renders role-tagged turns into a single prompt string with minijinja, the
//! same Jinja dialect GGUF models ship their `tokenizer.chat_template` in.

use minijinja::{context, Environment, Error, ErrorKind};

use crate::types::ChatMessage;

/// System persona used when the conversation does not start with a system turn
pub const DEFAULT_SYSTEM_PERSONA: &str = "You are a helpful AI assistant running locally on this device.";

/// ChatML template used when neither the caller nor the model provides one.
///
/// Synthesizes a system turn with [`DEFAULT_SYSTEM_PERSONA`] if the first message is not one.
pub const DEFAULT_CHAT_TEMPLATE: &str = "{% for message in messages %}\
{% if loop.first and messages[0]['role'] != 'system' %}\
{{ '<|im_start|>system\\nYou are a helpful AI assistant running locally on this device.<|im_end|>\\n' }}\
{% endif %}\
{{ '<|im_start|>' + message['role'] + '\\n' + message['content'] + '<|im_end|>' + '\\n' }}\
{% endfor %}\
{% if add_generation_prompt %}{{ '<|im_start|>assistant\\n' }}{% endif %}";

const TEMPLATE_NAME: &str = "chat";

/// A compiled chat template
pub struct ChatTemplate {
    env: Environment<'static>,
    source: String,
}

impl ChatTemplate {
    /// Compiles a template, failing on syntax errors
    pub fn new(source: impl Into<String>) -> Result<Self, Error> {
        let source = source.into();
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        // Hugging Face templates call raise_exception on unsupported conversations
        env.add_function("raise_exception", |message: String| -> Result<String, Error> {
            Err(Error::new(ErrorKind::InvalidOperation, message))
        });
        env.add_template_owned(TEMPLATE_NAME, source.clone())?;
        Ok(Self { env, source })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Renders the conversation, optionally opening an assistant turn at the end
    pub fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> Result<String, Error> {
        let template = self.env.get_template(TEMPLATE_NAME)?;
        template.render(context! {
            messages => messages,
            add_generation_prompt => add_generation_prompt,
            bos_token => "",
            eos_token => "",
        })
    }
}

impl std::fmt::Debug for ChatTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatTemplate").field("source", &self.source).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtin() -> ChatTemplate {
        ChatTemplate::new(DEFAULT_CHAT_TEMPLATE).unwrap()
    }

    #[test]
    fn test_default_template_synthesizes_system_turn() {
        let rendered = builtin()
            .render(&[ChatMessage::user("hi")], true)
            .unwrap();
        assert_eq!(
            rendered,
            format!(
                "<|im_start|>system\n{DEFAULT_SYSTEM_PERSONA}<|im_end|>\n\
                 <|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n"
            )
        );
    }

    #[test]
    fn test_default_template_keeps_explicit_system_turn() {
        let rendered = builtin()
            .render(&[ChatMessage::system("be brief"), ChatMessage::user("hi")], false)
            .unwrap();
        assert!(rendered.starts_with("<|im_start|>system\nbe brief<|im_end|>\n"));
        assert!(!rendered.contains(DEFAULT_SYSTEM_PERSONA));
        assert!(!rendered.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn test_custom_template() {
        let template = ChatTemplate::new(
            "{% for m in messages %}<|{{ m.role }}|>\n{{ m.content }}<|end|>\n{% endfor %}\
             {% if add_generation_prompt %}<|assistant|>\n{% endif %}",
        )
        .unwrap();
        let rendered = template.render(&[ChatMessage::user("pw")], true).unwrap();
        assert_eq!(rendered, "<|user|>\npw<|end|>\n<|assistant|>\n");
    }

    #[test]
    fn test_empty_conversation_renders() {
        let rendered = builtin().render(&[], true).unwrap();
        assert_eq!(rendered, "<|im_start|>assistant\n");
    }

    #[test]
    fn test_syntax_error_rejected() {
        assert!(ChatTemplate::new("{% for m in messages %}").is_err());
    }

    #[test]
    fn test_raise_exception_surfaces_error() {
        let template =
            ChatTemplate::new("{% if messages|length == 0 %}{{ raise_exception('no messages') }}{% endif %}")
                .unwrap();
        let err = template.render(&[], true).unwrap_err();
        assert!(err.to_string().contains("no messages"));
    }
}
