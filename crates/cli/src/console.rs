//! A [`ConversationDriver`] that asks the person at the terminal.
//!
//! Elicitations become prompts for each field of the requested schema.
//! Sampling requests show the conversation and take the typed line as the
//! assistant reply.

use {
    async_trait::async_trait,
    mcphub_bus::{
        ConversationDriver, ElicitationRequest, Error as BusError, ProgressEvent, Result as BusResult,
        SamplingRequest,
    },
    mcphub_mcp::types::{
        CreateMessageResult, ElicitAction, ElicitResult, Role, SamplingMessage, ToolContent,
    },
    serde_json::{Map, Value},
    tokio::{
        io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
        sync::Mutex,
    },
    tracing::debug,
};

/// Model name reported for replies typed at the console.
pub const CONSOLE_MODEL: &str = "console";

struct Io<R, W> {
    input: R,
    output: W,
}

pub struct ConsoleDriver<R, W> {
    // Requests arrive concurrently; one prompt at a time.
    io: Mutex<Io<R, W>>,
}

impl ConsoleDriver<tokio::io::BufReader<tokio::io::Stdin>, tokio::io::Stderr> {
    pub fn stdio() -> Self {
        Self::new(
            tokio::io::BufReader::new(tokio::io::stdin()),
            tokio::io::stderr(),
        )
    }
}

impl<R, W> ConsoleDriver<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(input: R, output: W) -> Self {
        Self {
            io: Mutex::new(Io { input, output }),
        }
    }
}

impl<R, W> Io<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn say(&mut self, text: &str) -> BusResult<()> {
        self.output
            .write_all(text.as_bytes())
            .await
            .map_err(|e| BusError::message(format!("console write failed: {e}")))?;
        self.output
            .flush()
            .await
            .map_err(|e| BusError::message(format!("console write failed: {e}")))
    }

    /// Next trimmed line; `None` at end of input.
    async fn ask(&mut self, prompt: &str) -> BusResult<Option<String>> {
        self.say(prompt).await?;
        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .await
            .map_err(|e| BusError::message(format!("console read failed: {e}")))?;
        Ok((read > 0).then(|| line.trim().to_string()))
    }
}

fn parse_action(answer: &str) -> Option<ElicitAction> {
    match answer.to_ascii_lowercase().as_str() {
        "a" | "accept" | "y" | "yes" => Some(ElicitAction::Accept),
        "d" | "decline" | "n" | "no" => Some(ElicitAction::Decline),
        "c" | "cancel" => Some(ElicitAction::Cancel),
        _ => None,
    }
}

/// Convert a typed answer to the JSON type the schema asks for.
fn parse_field(kind: &str, answer: &str) -> Option<Value> {
    match kind {
        "integer" => answer.parse::<i64>().ok().map(Value::from),
        "number" => answer.parse::<f64>().ok().map(Value::from),
        "boolean" => match answer.to_ascii_lowercase().as_str() {
            "y" | "yes" | "true" => Some(Value::Bool(true)),
            "n" | "no" | "false" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => Some(Value::String(answer.to_string())),
    }
}

fn cancelled() -> ElicitResult {
    ElicitResult {
        action: ElicitAction::Cancel,
        content: None,
    }
}

fn transcript(messages: &[SamplingMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        let who = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let text = message.content.as_text().unwrap_or("[non-text content]");
        out.push_str(&format!("  {who}: {text}\n"));
    }
    out
}

#[async_trait]
impl<R, W> ConversationDriver for ConsoleDriver<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn sample(
        &self,
        session_id: &str,
        request: &SamplingRequest,
    ) -> BusResult<CreateMessageResult> {
        let params = &request.inner;
        let mut io = self.io.lock().await;
        io.say(&format!("\nThe server asks for a completion (max {} tokens):\n", params.max_tokens))
            .await?;
        if let Some(system) = &params.system_prompt {
            io.say(&format!("  system: {system}\n")).await?;
        }
        io.say(&transcript(&params.messages)).await?;
        let Some(reply) = io.ask("reply> ").await? else {
            return Err(BusError::message("console closed before a reply was typed"));
        };
        debug!(session = session_id, tool_call_id = %request.tool_call_id, "sampling answered at console");
        Ok(CreateMessageResult {
            role: Role::Assistant,
            content: ToolContent::text(reply),
            model: CONSOLE_MODEL.into(),
            stop_reason: Some("endTurn".into()),
        })
    }

    async fn elicit(&self, session_id: &str, request: &ElicitationRequest) -> BusResult<ElicitResult> {
        let params = &request.inner;
        let mut io = self.io.lock().await;
        io.say(&format!("\n{}\n", params.message)).await?;

        let action = loop {
            let Some(answer) = io.ask("[a]ccept, [d]ecline or [c]ancel? ").await? else {
                return Ok(cancelled());
            };
            if let Some(action) = parse_action(&answer) {
                break action;
            }
        };
        if action != ElicitAction::Accept {
            return Ok(ElicitResult {
                action,
                content: None,
            });
        }

        let required: Vec<&str> = params.requested_schema["required"]
            .as_array()
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let mut content = Map::new();
        if let Some(properties) = params.requested_schema["properties"].as_object() {
            let mut fields: Vec<(&String, &Value)> = properties.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            for (name, schema) in fields {
                let kind = schema["type"].as_str().unwrap_or("string");
                let optional = !required.contains(&name.as_str());
                let label = schema["description"].as_str().unwrap_or(name.as_str());
                loop {
                    let prompt = if optional {
                        format!("{label} ({kind}, optional): ")
                    } else {
                        format!("{label} ({kind}): ")
                    };
                    let Some(answer) = io.ask(&prompt).await? else {
                        return Ok(cancelled());
                    };
                    if answer.is_empty() {
                        if optional {
                            break;
                        }
                        io.say("  required\n").await?;
                        continue;
                    }
                    if let Some(value) = parse_field(kind, &answer) {
                        content.insert(name.clone(), value);
                        break;
                    }
                    io.say(&format!("  expected {kind}\n")).await?;
                }
            }
        }
        debug!(session = session_id, tool_call_id = %request.tool_call_id, fields = content.len(), "elicitation accepted at console");
        Ok(ElicitResult {
            action,
            content: Some(content),
        })
    }

    async fn on_progress(&self, _session_id: &str, event: &ProgressEvent) {
        let progress = &event.inner;
        let mut line = match progress.total {
            Some(total) => format!("  progress {}/{}", progress.progress, total),
            None => format!("  progress {}", progress.progress),
        };
        if let Some(message) = &progress.message {
            line.push_str(&format!(": {message}"));
        }
        line.push('\n');
        let mut io = self.io.lock().await;
        let _ = io.say(&line).await;
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        mcphub_bus::WithToolCall,
        mcphub_mcp::types::{CreateMessageParams, ElicitParams},
        serde_json::json,
    };

    fn driver(input: &'static str) -> ConsoleDriver<&'static [u8], Vec<u8>> {
        ConsoleDriver::new(input.as_bytes(), Vec::new())
    }

    fn output(driver: ConsoleDriver<&'static [u8], Vec<u8>>) -> String {
        String::from_utf8(driver.io.into_inner().output).unwrap()
    }

    fn elicitation(schema: Value) -> ElicitationRequest {
        WithToolCall::new("call-1", ElicitParams {
            message: "Deploy to production?".into(),
            requested_schema: schema,
        })
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "count": {"type": "integer"},
                "confirm": {"type": "boolean", "description": "Really"},
                "note": {"type": "string"}
            },
            "required": ["count", "confirm"]
        })
    }

    #[tokio::test]
    async fn accepted_elicitation_collects_typed_fields() {
        let console = driver("maybe\na\nyes\nthree\n3\n\n");
        let result = console.elicit("s1", &elicitation(schema())).await.unwrap();
        assert_eq!(result.action, ElicitAction::Accept);
        assert_eq!(
            Value::Object(result.content.unwrap()),
            json!({"count": 3, "confirm": true})
        );
        let shown = output(console);
        assert!(shown.contains("Deploy to production?"));
        assert!(shown.contains("Really (boolean): "));
        assert!(shown.contains("note (string, optional): "));
        assert!(shown.contains("  expected integer\n"));
    }

    #[tokio::test]
    async fn declined_elicitation_has_no_content() {
        let console = driver("decline\n");
        let result = console.elicit("s1", &elicitation(schema())).await.unwrap();
        assert_eq!(result.action, ElicitAction::Decline);
        assert!(result.content.is_none());
    }

    #[tokio::test]
    async fn end_of_input_cancels() {
        let console = driver("a\n4\n");
        let result = console.elicit("s1", &elicitation(schema())).await.unwrap();
        assert_eq!(result, cancelled());
    }

    #[tokio::test]
    async fn sampling_takes_the_typed_reply() {
        let console = driver("three bullet points\n");
        let request = WithToolCall::new("call-1", CreateMessageParams {
            messages: vec![SamplingMessage {
                role: Role::User,
                content: ToolContent::text("Summarize the report"),
            }],
            max_tokens: 32,
            system_prompt: Some("Be brief".into()),
            temperature: None,
            stop_sequences: None,
            include_context: None,
            model_preferences: None,
            metadata: None,
        });
        let result = console.sample("s1", &request).await.unwrap();
        assert_eq!(result.content.as_text(), Some("three bullet points"));
        assert_eq!(result.model, CONSOLE_MODEL);
        let shown = output(console);
        assert!(shown.contains("  system: Be brief\n"));
        assert!(shown.contains("  user: Summarize the report\n"));
    }

    #[tokio::test]
    async fn sampling_without_a_reply_fails() {
        let console = driver("");
        let request = WithToolCall::new("call-1", CreateMessageParams {
            messages: Vec::new(),
            max_tokens: 8,
            system_prompt: None,
            temperature: None,
            stop_sequences: None,
            include_context: None,
            model_preferences: None,
            metadata: None,
        });
        assert!(console.sample("s1", &request).await.is_err());
    }
}
