mod claude;
mod deepseek;
mod gemini;
mod grok;
mod openai;

pub use claude::ClaudeProvider;
pub use deepseek::DeepSeekProvider;
pub use gemini::GeminiProvider;
pub use grok::GrokProvider;
pub use openai::OpenAiProvider;
