use anyhow::Result;
use gradgraph::ir::text_ir::{parse_function, parse_module, parse_module_with_symbols};
use gradgraph::ir::{verify_module, Module};
use gradgraph::{differentiate_in_module, graph_module};

const MODEL: &str = r#"
func @model(%x: tensor<f32, 2x3>, %pair: (tensor<f32, 3>, tensor<f32, 3>)) -> tensor<f32> {
  %a = add(%x, %pair[0]) -> tensor<f32, 2x3>
  %m = multiply(%a, %pair[1]) -> tensor<f32, 2x3>
  %k = 0.5 -> tensor<f32>
  %h = multiply(%m, %k) -> tensor<f32, 2x3>
  %t = transpose(%h) perm[1, 0] -> tensor<f32, 3x2>
  %r = sum(%t) axes[1] keepdims[true] -> tensor<f32, 3x1>
  %s = sum(%r) -> tensor<f32>
  return %s
}
"#;

#[test]
fn printed_functions_parse_back() -> Result<()> {
    let mut module = graph_module!(MODEL);
    differentiate_in_module(&mut module, "model", None)?;
    verify_module(&module)?;
    for function in module.iter() {
        let reparsed = parse_function(&function.to_text())?;
        assert_eq!(&reparsed, function, "{}", function.to_text());
    }
    let reparsed = parse_module(&module.to_text())?;
    assert_eq!(reparsed, module);
    Ok(())
}

#[test]
fn tuple_parameters_get_tuple_gradients() -> Result<()> {
    let mut module = graph_module!(MODEL);
    let name = differentiate_in_module(&mut module, "model", None)?;
    let adjoint = module.get(&name).expect("adjoint inserted");
    let pair_adjoint = adjoint.value_id("pair_adjoint").expect("pair gradient");
    assert_eq!(
        adjoint.value_type(pair_adjoint).map(|ty| ty.to_string()),
        Some("(tensor<f32, 3>, tensor<f32, 3>)".to_string())
    );
    Ok(())
}

#[test]
fn json_and_bincode_round_trip() -> Result<()> {
    let mut module = graph_module!(MODEL);
    differentiate_in_module(&mut module, "model", None)?;

    let json = module.to_json_string()?;
    assert_eq!(Module::from_json_str(&json)?, module);

    let bytes = module.to_bincode_bytes()?;
    assert_eq!(Module::from_bincode_slice(&bytes)?, module);

    let path = std::env::temp_dir().join(format!("gradgraph-ir-{}.json", std::process::id()));
    module.save_json(&path)?;
    let loaded = Module::load_json(&path);
    let _ = std::fs::remove_file(&path);
    assert_eq!(loaded?, module);
    Ok(())
}

#[test]
fn symbols_map_names_to_ids() -> Result<()> {
    let parsed = parse_module_with_symbols(MODEL)?;
    let function = parsed.module.get("model").expect("model");
    let h = parsed.value("model", "h").expect("h");
    assert_eq!(function.value_name(h), Some("h"));
    assert!(parsed.value("model", "missing").is_none());
    Ok(())
}
