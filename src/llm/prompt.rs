//! The fixed instruction template shared by training and inference.
//!
//! The adapter is trained on strings produced by [`training_text`]; at
//! inference time the model is prompted with [`inference_prompt`] and expected
//! to continue with the response. The two must stay byte-identical up to the
//! point where the response starts.

/// Wrap a raw instruction in the template, ready for generation.
pub fn inference_prompt(instruction: &str) -> String {
    format!("### Instruction:\n{instruction}\n\n### Response:\n")
}

/// Full training target: the inference prompt with the response appended.
pub fn training_text(instruction: &str, response: &str) -> String {
    format!("{}{}", inference_prompt(instruction), response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn training_and_inference_templates_match() {
        let i = "What is a lifetime?";
        let r = "A region of code a reference is valid for.";
        let text = training_text(i, r);
        assert!(text.starts_with(&inference_prompt(i)));
        assert_eq!(text, format!("{}{}", inference_prompt(i), r));
    }

    #[test]
    fn template_shape() {
        let p = inference_prompt("hi");
        assert_eq!(p, "### Instruction:\nhi\n\n### Response:\n");
        assert!(p.contains("### Instruction:"));
        assert!(p.ends_with("### Response:\n"));
    }
}
