//! Prompt formatting and cache key derivation for the grammar domain.

use crate::client::{LanguageModel, Message, Prompt};
use crate::models::{CacheKeyPolicy, CtrlError, Instance, Result};
use crate::pipeline::{CacheKeyFn, PromptFormatter};
use std::path::Path;
use std::sync::Arc;

/// Chat messages for chat-tuned models, plain text otherwise.
///
/// The system prompt, if any, leads the conversation or is prepended to the
/// text prompt.
pub fn default_prompt_formatter(system_prompt: Option<String>) -> PromptFormatter {
    Arc::new(move |lm: &LanguageModel, instance: &Instance| {
        if lm.is_chat_tuned() {
            let mut messages = Vec::with_capacity(2);
            if let Some(system) = &system_prompt {
                messages.push(Message::system(system.clone()));
            }
            messages.push(Message::user(instance.prompt.clone()));
            Prompt::Chat(messages)
        } else {
            match &system_prompt {
                Some(system) => Prompt::Text(format!("{system}\n\n{}", instance.prompt)),
                None => Prompt::Text(instance.prompt.clone()),
            }
        }
    })
}

pub fn load_system_prompt(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map(|s| s.trim_end().to_string())
        .map_err(|e| CtrlError::io(format!("reading system prompt {}", path.display()), e))
}

/// Cache key function for a policy; `None` disables caching.
pub fn cache_key_fn(policy: CacheKeyPolicy) -> Option<CacheKeyFn> {
    match policy {
        CacheKeyPolicy::None => None,
        CacheKeyPolicy::Schema => Some(Arc::new(|instance: &Instance| instance.schema.clone())),
        CacheKeyPolicy::Constant => Some(Arc::new(|_: &Instance| Some("shared".to_string()))),
        CacheKeyPolicy::Instance => {
            Some(Arc::new(|instance: &Instance| Some(instance.instance_id.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_model_gets_messages() {
        let formatter = default_prompt_formatter(Some("You write SQL.".to_string()));
        let lm = LanguageModel::new("meta-llama/Meta-Llama-3.1-8B-Instruct");
        let prompt = formatter(&lm, &Instance::new("q1", "How many singers?"));

        assert_eq!(
            prompt,
            Prompt::Chat(vec![
                Message::system("You write SQL."),
                Message::user("How many singers?"),
            ])
        );
    }

    #[test]
    fn test_base_model_gets_text() {
        let formatter = default_prompt_formatter(None);
        let prompt = formatter(&LanguageModel::new("gpt2"), &Instance::new("q1", "CCO"));
        assert_eq!(prompt, Prompt::Text("CCO".to_string()));
    }

    #[test]
    fn test_cache_key_policies() {
        let instance = Instance::new("q1", "p").with_schema("concert_singer");
        let bare = Instance::new("q2", "p");

        assert!(cache_key_fn(CacheKeyPolicy::None).is_none());

        let schema = cache_key_fn(CacheKeyPolicy::Schema).unwrap();
        assert_eq!(schema(&instance).as_deref(), Some("concert_singer"));
        assert_eq!(schema(&bare), None);

        let constant = cache_key_fn(CacheKeyPolicy::Constant).unwrap();
        assert_eq!(constant(&instance), constant(&bare));

        let per_instance = cache_key_fn(CacheKeyPolicy::Instance).unwrap();
        assert_eq!(per_instance(&bare).as_deref(), Some("q2"));
    }
}
