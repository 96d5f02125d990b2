use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use emx_core::{ModelError, ParamValue};

use crate::config::{BindingAction, FillToken, ModelConfig};

/// Apply every binding action for a fully resolved parameter vector to the
/// model tree at `model_dir`. Actions run in scope declaration order (the
/// order of `resolved`), then config order within one parameter, so repeated
/// setups with the same mapping produce identical workspaces. Returns the
/// extra argv entries contributed by `argument` bindings.
pub fn apply_bindings(
    config: &ModelConfig,
    model_dir: &Path,
    resolved: &[(String, ParamValue)],
) -> Result<Vec<String>, ModelError> {
    for binding in &config.bindings {
        if !resolved.iter().any(|(n, _)| n == &binding.parameter) {
            return Err(ModelError::Setup(format!(
                "binding references parameter '{}' which the scope does not declare",
                binding.parameter
            )));
        }
    }
    let mut args = Vec::new();
    for (name, value) in resolved {
        for binding in config.bindings.iter().filter(|b| &b.parameter == name) {
            apply_one(config, model_dir, name, value, &binding.action, &mut args)?;
        }
    }
    Ok(args)
}

fn apply_one(
    config: &ModelConfig,
    model_dir: &Path,
    name: &str,
    value: &ParamValue,
    action: &BindingAction,
    args: &mut Vec<String>,
) -> Result<(), ModelError> {
    match action {
        BindingAction::Assign {
            file,
            key,
            operator,
        } => {
            let path = model_dir.join(file);
            let text = fs::read_to_string(&path).map_err(|e| {
                ModelError::Setup(format!("cannot read {}: {}", path.display(), e))
            })?;
            let (edited, count) = replace_assignment(&text, key, operator, value);
            if count == 0 {
                return Err(ModelError::Setup(format!(
                    "no assignment '{}{}' found in {}",
                    key,
                    operator,
                    path.display()
                )));
            }
            debug!(parameter = name, file = %path.display(), substitutions = count, "assign");
            fs::write(&path, edited)?;
        }
        BindingAction::Fill {
            template,
            output,
            substitutions,
        } => {
            let src = source_path(config, model_dir, template);
            let mut rendered = fs::read_to_string(&src).map_err(|e| {
                ModelError::Setup(format!("cannot read template {}: {}", src.display(), e))
            })?;
            let implicit = [FillToken {
                placeholder: None,
                scale: 1.0,
            }];
            let tokens: &[FillToken] = if substitutions.is_empty() {
                &implicit
            } else {
                substitutions
            };
            for token in tokens {
                let placeholder = token
                    .placeholder
                    .clone()
                    .unwrap_or_else(|| format!("__{}__", name));
                if !rendered.contains(&placeholder) {
                    return Err(ModelError::Setup(format!(
                        "placeholder '{}' not present in template {}",
                        placeholder,
                        src.display()
                    )));
                }
                rendered = rendered.replace(&placeholder, &scaled_text(value, token.scale)?);
            }
            if let Some(leftover) = leftover_token(&rendered) {
                return Err(ModelError::Setup(format!(
                    "token '{}' in template {} has no substitution",
                    leftover,
                    src.display()
                )));
            }
            let out = model_dir.join(output);
            if let Some(parent) = out.parent() {
                emx_core::fsutil::ensure_dir(parent)?;
            }
            debug!(parameter = name, output = %out.display(), tokens = tokens.len(), "fill");
            fs::write(&out, rendered)?;
        }
        BindingAction::Variant { dest, choices } => {
            let category = match value {
                ParamValue::Text(s) => s.clone(),
                ParamValue::Number(n) => n.to_string(),
            };
            let chosen = choices.get(&category).ok_or_else(|| {
                ModelError::Setup(format!(
                    "parameter '{}' has no file variant for category '{}'",
                    name, category
                ))
            })?;
            let src = source_path(config, model_dir, chosen);
            if !src.is_dir() {
                return Err(ModelError::Setup(format!(
                    "variant directory not found: {}",
                    src.display()
                )));
            }
            let dest_dir = model_dir.join(dest);
            emx_core::fsutil::ensure_dir(&dest_dir)?;
            for entry in fs::read_dir(&src)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    fs::copy(entry.path(), dest_dir.join(entry.file_name()))?;
                }
            }
            debug!(parameter = name, category, dest = %dest_dir.display(), "variant");
        }
        BindingAction::Mixture {
            dest,
            low,
            high,
            keys,
        } => {
            let weight = value.as_number().ok_or_else(|| {
                ModelError::Setup(format!(
                    "parameter '{}' must be numeric to blend a file mixture",
                    name
                ))
            })?;
            if !(0.0..=1.0).contains(&weight) {
                return Err(ModelError::Setup(format!(
                    "parameter '{}' mixture weight {} is outside [0, 1]",
                    name, weight
                )));
            }
            let low_dir = source_path(config, model_dir, low);
            let high_dir = source_path(config, model_dir, high);
            let dest_dir = model_dir.join(dest);
            emx_core::fsutil::ensure_dir(&dest_dir)?;
            if !low_dir.is_dir() {
                return Err(ModelError::Setup(format!(
                    "mixture directory not found: {}",
                    low_dir.display()
                )));
            }
            for entry in fs::read_dir(&low_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let file_name = entry.file_name();
                let high_path = high_dir.join(&file_name);
                if !high_path.is_file() {
                    return Err(ModelError::Setup(format!(
                        "mixture file {} missing from {}",
                        file_name.to_string_lossy(),
                        high_dir.display()
                    )));
                }
                blend_csv(
                    &entry.path(),
                    &high_path,
                    &dest_dir.join(&file_name),
                    weight,
                    keys,
                )?;
            }
            debug!(parameter = name, weight, dest = %dest_dir.display(), "mixture");
        }
        BindingAction::JsonPointer {
            file,
            pointer,
            as_string,
        } => {
            let path = model_dir.join(file);
            let mut doc: Value = serde_json::from_slice(&fs::read(&path).map_err(|e| {
                ModelError::Setup(format!("cannot read {}: {}", path.display(), e))
            })?)?;
            let new = if *as_string {
                Value::String(value.to_string())
            } else {
                serde_json::to_value(value)?
            };
            set_json_pointer(&mut doc, pointer, new)?;
            debug!(parameter = name, file = %path.display(), pointer, "json edit");
            fs::write(&path, serde_json::to_vec_pretty(&doc)?)?;
        }
        BindingAction::Argument { flag } => {
            if let Some(flag) = flag {
                args.push(flag.clone());
            }
            args.push(value.to_string());
        }
    }
    Ok(())
}

fn scaled_text(value: &ParamValue, scale: f64) -> Result<String, ModelError> {
    match value {
        ParamValue::Number(n) => Ok((n * scale).to_string()),
        ParamValue::Text(t) if scale == 1.0 => Ok(t.clone()),
        ParamValue::Text(t) => Err(ModelError::Setup(format!(
            "cannot scale categorical value '{}'",
            t
        ))),
    }
}

/// First `__NAME__` style token remaining in a rendered template, if any.
/// An unreplaced token would flow verbatim into the simulator's inputs.
fn leftover_token(text: &str) -> Option<&str> {
    let mut offset = 0;
    while let Some(start) = text[offset..].find("__") {
        let start = offset + start;
        let rest = &text[start + 2..];
        let Some(end) = rest.find("__") else {
            return None;
        };
        let inner = &rest[..end];
        if !inner.is_empty() && inner.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Some(&text[start..start + 2 + end + 2]);
        }
        offset = start + 2 + end;
    }
    None
}

/// Weight-blend two CSV variant files into `out`: numeric cells become
/// `(1 - weight) * low + weight * high`; key columns and non-numeric cells
/// are taken from the low variant. Headers and row counts must line up.
fn blend_csv(
    low: &Path,
    high: &Path,
    out: &Path,
    weight: f64,
    keys: &[String],
) -> Result<(), ModelError> {
    let (headers, low_rows) = read_csv(low)?;
    let (high_headers, high_rows) = read_csv(high)?;
    if headers != high_headers || low_rows.len() != high_rows.len() {
        return Err(ModelError::Setup(format!(
            "mixture inputs {} and {} do not line up",
            low.display(),
            high.display()
        )));
    }
    let mut writer = csv::Writer::from_path(out)
        .map_err(|e| ModelError::Setup(format!("cannot write {}: {}", out.display(), e)))?;
    writer
        .write_record(&headers)
        .map_err(|e| ModelError::Setup(format!("cannot write {}: {}", out.display(), e)))?;
    for (lo, hi) in low_rows.iter().zip(&high_rows) {
        let mut blended = Vec::with_capacity(lo.len());
        for ((header, a), b) in headers.iter().zip(lo).zip(hi) {
            if keys.iter().any(|k| k == header) {
                blended.push(a.clone());
                continue;
            }
            match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
                (Ok(x), Ok(y)) => blended.push(((1.0 - weight) * x + weight * y).to_string()),
                _ => blended.push(a.clone()),
            }
        }
        writer
            .write_record(&blended)
            .map_err(|e| ModelError::Setup(format!("cannot write {}: {}", out.display(), e)))?;
    }
    writer
        .flush()
        .map_err(|e| ModelError::Setup(format!("cannot write {}: {}", out.display(), e)))?;
    Ok(())
}

fn read_csv(path: &Path) -> Result<(Vec<String>, Vec<Vec<String>>), ModelError> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| ModelError::Setup(format!("cannot read {}: {}", path.display(), e)))?;
    let headers = reader
        .headers()
        .map_err(|e| ModelError::Setup(format!("cannot read {}: {}", path.display(), e)))?
        .iter()
        .map(|h| h.to_string())
        .collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record
            .map_err(|e| ModelError::Setup(format!("cannot read {}: {}", path.display(), e)))?;
        rows.push(record.iter().map(|f| f.to_string()).collect());
    }
    Ok((headers, rows))
}

fn source_path(config: &ModelConfig, model_dir: &Path, rel: &str) -> PathBuf {
    let p = Path::new(rel);
    if p.is_absolute() {
        return p.to_path_buf();
    }
    match &config.scenario_path {
        Some(root) => root.join(p),
        None => model_dir.join(p),
    }
}

/// Rewrite every `key <operator> value` assignment in `text`, preserving
/// whatever follows the value (typically a `#` comment). Numeric values
/// replace only the numeric token; text values replace up to the comment.
/// Returns the edited text and the substitution count.
pub fn replace_assignment(
    text: &str,
    key: &str,
    operator: &str,
    value: &ParamValue,
) -> (String, usize) {
    let mut out = String::with_capacity(text.len());
    let mut count = 0;
    for line in text.split_inclusive('\n') {
        out.push_str(&replace_in_line(line, key, operator, value, &mut count));
    }
    (out, count)
}

fn replace_in_line(
    line: &str,
    key: &str,
    operator: &str,
    value: &ParamValue,
    count: &mut usize,
) -> String {
    let Some(start) = find_key(line, key) else {
        return line.to_string();
    };
    let after_key = start + key.len();
    let rest = &line[after_key..];
    let ws = rest.len() - rest.trim_start().len();
    let rest_trimmed = &rest[ws..];
    if !rest_trimmed.starts_with(operator) {
        return line.to_string();
    }
    let after_op = after_key + ws + operator.len();
    let rest = &line[after_op..];
    let ws2 = rest.len() - rest.trim_start().len();
    let value_start = after_op + ws2;
    let tail = &line[value_start..];

    let token_len = match value {
        ParamValue::Number(_) => tail
            .char_indices()
            .take_while(|(_, c)| c.is_ascii_digit() || "+-.eE/".contains(*c))
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0),
        // Text assignments consume through the value, stopping at a comment.
        ParamValue::Text(_) => tail
            .find('#')
            .map(|i| tail[..i].trim_end().len())
            .unwrap_or_else(|| tail.trim_end().len()),
    };
    if token_len == 0 {
        return line.to_string();
    }
    *count += 1;
    let mut edited = String::with_capacity(line.len());
    edited.push_str(&line[..value_start]);
    edited.push_str(&value.to_string());
    edited.push_str(&replace_in_line(
        &tail[token_len..],
        key,
        operator,
        value,
        count,
    ));
    edited
}

fn find_key(line: &str, key: &str) -> Option<usize> {
    for (idx, _) in line.match_indices(key) {
        let before_ok = idx == 0
            || !line[..idx]
                .chars()
                .next_back()
                .map(|c| c.is_alphanumeric() || c == '_')
                .unwrap_or(false);
        let after = &line[idx + key.len()..];
        let after_ok = !after
            .chars()
            .next()
            .map(|c| c.is_alphanumeric() || c == '_')
            .unwrap_or(false);
        if before_ok && after_ok {
            return Some(idx);
        }
    }
    None
}

/// Set a JSON pointer, creating intermediate objects as needed. Array
/// segments must already exist.
fn set_json_pointer(root: &mut Value, pointer: &str, new: Value) -> Result<(), ModelError> {
    if pointer.is_empty() || !pointer.starts_with('/') {
        return Err(ModelError::Setup(format!("invalid json pointer '{}'", pointer)));
    }
    let segments: Vec<&str> = pointer[1..].split('/').collect();
    let mut cursor = root;
    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        match cursor {
            Value::Array(array) => {
                let idx: usize = segment.parse().map_err(|_| {
                    ModelError::Setup(format!(
                        "non-numeric array index '{}' in '{}'",
                        segment, pointer
                    ))
                })?;
                let slot = array.get_mut(idx).ok_or_else(|| {
                    ModelError::Setup(format!("array index {} out of range in '{}'", idx, pointer))
                })?;
                if last {
                    *slot = new;
                    return Ok(());
                }
                cursor = slot;
            }
            Value::Object(map) => {
                if last {
                    map.insert(segment.to_string(), new);
                    return Ok(());
                }
                cursor = map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Default::default()));
            }
            _ => {
                return Err(ModelError::Setup(format!(
                    "cannot descend into scalar at '{}' of '{}'",
                    segment, pointer
                )))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_dir;
    use serde_json::json;

    #[test]
    fn numeric_assignment_preserves_comment() {
        let text = "ValueOfTime: 13  # dollars per hour\nOther: 2\n";
        let (edited, n) =
            replace_assignment(text, "ValueOfTime", ":", &ParamValue::Number(17.5));
        assert_eq!(n, 1);
        assert_eq!(edited, "ValueOfTime: 17.5  # dollars per hour\nOther: 2\n");
    }

    #[test]
    fn text_assignment_replaces_through_comment_boundary() {
        let text = "LandUse: base   # scenario\n";
        let (edited, n) = replace_assignment(text, "LandUse", ":", &"growth".into());
        assert_eq!(n, 1);
        assert_eq!(edited, "LandUse: growth   # scenario\n");
    }

    #[test]
    fn key_matches_are_word_bounded() {
        let text = "MyRate: 1\nRate: 2\n";
        let (edited, n) = replace_assignment(text, "Rate", ":", &ParamValue::Number(9.0));
        assert_eq!(n, 1);
        assert_eq!(edited, "MyRate: 1\nRate: 9\n");
    }

    #[test]
    fn assignment_supports_other_operators() {
        let text = "fuel_cost <- 2.43\n";
        let (edited, n) =
            replace_assignment(text, "fuel_cost", "<-", &ParamValue::Number(3.0));
        assert_eq!(n, 1);
        assert_eq!(edited, "fuel_cost <- 3\n");
    }

    #[test]
    fn json_pointer_sets_nested_array_field() {
        let mut doc = json!([{"NAME": "ValueOfTime", "VALUE": "13"}]);
        set_json_pointer(&mut doc, "/0/VALUE", json!("17")).expect("set");
        assert_eq!(doc[0]["VALUE"], json!("17"));
    }

    #[test]
    fn json_pointer_walks_objects_and_arrays_alternately() {
        let mut doc = json!({"params": [{"NAME": "ValueOfTime", "VALUE": "13"}]});
        set_json_pointer(&mut doc, "/params/0/VALUE", json!("21")).expect("set");
        assert_eq!(doc["params"][0]["VALUE"], json!("21"));
        let err = set_json_pointer(&mut doc, "/params/9/VALUE", json!("0")).expect_err("range");
        assert_eq!(err.kind(), "setup");
        let err =
            set_json_pointer(&mut doc, "/params/0/NAME/deep", json!("x")).expect_err("scalar");
        assert_eq!(err.kind(), "setup");
    }

    fn demo_config(dir: &Path) -> ModelConfig {
        ModelConfig::from_yaml_str(&format!(
            r#"
scope_file: scope.yml
model_source: MODEL
model_path: MODEL
archive_path: archive
scenario_path: {}
command: ["true"]
bindings:
  - parameter: Income
    fill: {{ template: income.csv.template, output: inputs/income.csv }}
  - parameter: LandUse
    variant:
      dest: inputs
      choices: {{ base: L/1, growth: L/2 }}
  - parameter: ValueOfTime
    assign: {{ file: defs/params.yml, key: ValueOfTime }}
"#,
            dir.join("scenario_inputs").display()
        ))
        .expect("config")
    }

    fn stage(dir: &Path) -> PathBuf {
        let scenario = dir.join("scenario_inputs");
        fs::create_dir_all(scenario.join("L/1")).expect("mkdir");
        fs::create_dir_all(scenario.join("L/2")).expect("mkdir");
        fs::write(scenario.join("L/1/land.csv"), "Geo,Density\na,1\n").expect("write");
        fs::write(scenario.join("L/2/land.csv"), "Geo,Density\na,2\n").expect("write");
        fs::write(
            scenario.join("income.csv.template"),
            "Year,HHIncomePC\n2038,__Income__\n",
        )
        .expect("write");
        let model = dir.join("ws/MODEL");
        fs::create_dir_all(model.join("defs")).expect("mkdir");
        fs::write(model.join("defs/params.yml"), "ValueOfTime: 13\n").expect("write");
        model
    }

    fn resolved() -> Vec<(String, ParamValue)> {
        vec![
            ("ValueOfTime".to_string(), ParamValue::Number(17.0)),
            ("Income".to_string(), ParamValue::Number(50000.0)),
            ("LandUse".to_string(), "growth".into()),
        ]
    }

    #[test]
    fn bindings_materialize_all_three_action_kinds() {
        let dir = test_dir("binder");
        let model = stage(&dir);
        let config = demo_config(&dir);
        let args = apply_bindings(&config, &model, &resolved()).expect("bind");
        assert!(args.is_empty());
        assert_eq!(
            fs::read_to_string(model.join("defs/params.yml")).expect("read"),
            "ValueOfTime: 17\n"
        );
        assert_eq!(
            fs::read_to_string(model.join("inputs/income.csv")).expect("read"),
            "Year,HHIncomePC\n2038,50000\n"
        );
        assert_eq!(
            fs::read_to_string(model.join("inputs/land.csv")).expect("read"),
            "Geo,Density\na,2\n"
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn rebinding_supersedes_prior_experiment() {
        let dir = test_dir("binder_rebind");
        let model = stage(&dir);
        let config = demo_config(&dir);
        apply_bindings(&config, &model, &resolved()).expect("first bind");
        let mut second = resolved();
        second[0].1 = ParamValue::Number(21.0);
        second[2].1 = "base".into();
        apply_bindings(&config, &model, &second).expect("second bind");
        assert_eq!(
            fs::read_to_string(model.join("defs/params.yml")).expect("read"),
            "ValueOfTime: 21\n"
        );
        assert_eq!(
            fs::read_to_string(model.join("inputs/land.csv")).expect("read"),
            "Geo,Density\na,1\n"
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn fill_substitutes_every_listed_token_with_its_scale() {
        let dir = test_dir("binder_tokens");
        let model = dir.join("ws/MODEL");
        fs::create_dir_all(&model).expect("mkdir");
        let scenario = dir.join("scenario_inputs");
        fs::create_dir_all(&scenario).expect("mkdir");
        fs::write(
            scenario.join("inc.csv.template"),
            "Year,HHIncomePC,GQIncomePC\n2038,__Income__,__GQIncome__\n",
        )
        .expect("write");
        let config = ModelConfig::from_yaml_str(&format!(
            r#"
scope_file: scope.yml
model_source: MODEL
model_path: MODEL
archive_path: archive
scenario_path: {}
command: ["true"]
bindings:
  - parameter: Income
    fill:
      template: inc.csv.template
      output: inputs/inc.csv
      substitutions:
        - placeholder: __Income__
        - placeholder: __GQIncome__
          scale: 0.25
"#,
            scenario.display()
        ))
        .expect("config");
        let resolved = vec![("Income".to_string(), ParamValue::Number(40000.0))];
        apply_bindings(&config, &model, &resolved).expect("bind");
        assert_eq!(
            fs::read_to_string(model.join("inputs/inc.csv")).expect("read"),
            "Year,HHIncomePC,GQIncomePC\n2038,40000,10000\n"
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn fill_rejects_templates_with_unsubstituted_tokens() {
        let dir = test_dir("binder_leftover");
        let model = dir.join("ws/MODEL");
        fs::create_dir_all(&model).expect("mkdir");
        let scenario = dir.join("scenario_inputs");
        fs::create_dir_all(&scenario).expect("mkdir");
        fs::write(
            scenario.join("inc.csv.template"),
            "Year,HHIncomePC,GQIncomePC\n2038,__Income__,__GQIncome__\n",
        )
        .expect("write");
        let config = ModelConfig::from_yaml_str(&format!(
            r#"
scope_file: scope.yml
model_source: MODEL
model_path: MODEL
archive_path: archive
scenario_path: {}
command: ["true"]
bindings:
  - parameter: Income
    fill: {{ template: inc.csv.template, output: inputs/inc.csv }}
"#,
            scenario.display()
        ))
        .expect("config");
        let resolved = vec![("Income".to_string(), ParamValue::Number(40000.0))];
        let err = apply_bindings(&config, &model, &resolved).expect_err("must fail");
        assert_eq!(err.kind(), "setup");
        assert!(err.to_string().contains("__GQIncome__"));
        assert!(!model.join("inputs/inc.csv").exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn mixture_blends_numeric_columns_between_variants() {
        let dir = test_dir("binder_mixture");
        let model = dir.join("ws/MODEL");
        fs::create_dir_all(&model).expect("mkdir");
        let scenario = dir.join("scenario_inputs");
        fs::create_dir_all(scenario.join("T/1")).expect("mkdir");
        fs::create_dir_all(scenario.join("T/2")).expect("mkdir");
        fs::write(
            scenario.join("T/1/tech.csv"),
            "Geo,Fuel,Share\na,gas,10\nb,gas,20\n",
        )
        .expect("write");
        fs::write(
            scenario.join("T/2/tech.csv"),
            "Geo,Fuel,Share\na,gas,20\nb,gas,40\n",
        )
        .expect("write");
        let config = ModelConfig::from_yaml_str(&format!(
            r#"
scope_file: scope.yml
model_source: MODEL
model_path: MODEL
archive_path: archive
scenario_path: {}
command: ["true"]
bindings:
  - parameter: TechMix
    mixture:
      dest: inputs
      low: T/1
      high: T/2
      keys: [Geo]
"#,
            scenario.display()
        ))
        .expect("config");
        let resolved = vec![("TechMix".to_string(), ParamValue::Number(0.5))];
        apply_bindings(&config, &model, &resolved).expect("bind");
        assert_eq!(
            fs::read_to_string(model.join("inputs/tech.csv")).expect("read"),
            "Geo,Fuel,Share\na,gas,15\nb,gas,30\n"
        );

        // Weight 0 reproduces the low variant exactly.
        let resolved = vec![("TechMix".to_string(), ParamValue::Number(0.0))];
        apply_bindings(&config, &model, &resolved).expect("bind");
        assert_eq!(
            fs::read_to_string(model.join("inputs/tech.csv")).expect("read"),
            "Geo,Fuel,Share\na,gas,10\nb,gas,20\n"
        );

        let resolved = vec![("TechMix".to_string(), ParamValue::Number(1.5))];
        let err = apply_bindings(&config, &model, &resolved).expect_err("must fail");
        assert_eq!(err.kind(), "setup");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn unknown_variant_category_is_a_setup_error() {
        let dir = test_dir("binder_variant");
        let model = stage(&dir);
        let config = demo_config(&dir);
        let mut params = resolved();
        params[2].1 = "sprawl".into();
        let err = apply_bindings(&config, &model, &params).expect_err("must fail");
        assert_eq!(err.kind(), "setup");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_template_is_a_setup_error() {
        let dir = test_dir("binder_template");
        let model = stage(&dir);
        let mut config = demo_config(&dir);
        config.scenario_path = Some(dir.join("nowhere"));
        let err = apply_bindings(&config, &model, &resolved()).expect_err("must fail");
        assert_eq!(err.kind(), "setup");
        let _ = fs::remove_dir_all(dir);
    }
}
