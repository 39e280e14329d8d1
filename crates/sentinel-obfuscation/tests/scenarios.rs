use sentinel_obfuscation::eval::evaluate;
use sentinel_obfuscation::technique::decode_encoded_command;
use sentinel_obfuscation::{
    ChainComposer, Decisions, Layer, ObfuscationLevel, Recipe, RecipeError, Technique,
};

const PRIMITIVE: &str = r#"Get-LocalGroupMember -Group "Administrators""#;

/// Undo one `Invoke-Expression` wrapper by evaluating its argument.
fn peel(output: &str) -> String {
    let lower = output.to_ascii_lowercase();
    let expr = if lower.ends_with("iex") || lower.ends_with("invoke-expression") {
        let pipe = output.rfind('|').expect("pipeline form");
        &output[..pipe]
    } else {
        let open = output.find('(').expect("call form");
        &output[open..]
    };
    evaluate(expr.trim()).unwrap_or_else(|e| panic!("{e}: {expr}"))
}

#[test]
fn scenario_a_deep_argument_chain_hides_the_cmdlet() {
    let recipe: Recipe = "TypeCast,TypeCast,ConcatEncode,ConcatEncode,ConcatEncode,CommandSplat"
        .parse()
        .unwrap();
    let composer = ChainComposer::new();
    for seed in 0..10 {
        let result = composer.compose(PRIMITIVE, &recipe, &mut Decisions::seeded(seed));
        assert!(result.success, "seed {seed}: {:?}", result.reason);
        let output = result.output.unwrap();
        assert!(!output.is_empty());
        assert!(
            !output.to_ascii_lowercase().contains("get-localgroupmember"),
            "seed {seed}: {output}"
        );
    }
}

#[test]
fn scenario_b_base64_finisher() {
    let recipe: Recipe = "ConcatEncode,Base64Wrap".parse().unwrap();
    let result = ChainComposer::new().compose(PRIMITIVE, &recipe, &mut Decisions::seeded(7));
    let output = result.output.unwrap();
    assert!(output.starts_with("powershell.exe -EncodedCommand "));
    let inner = decode_encoded_command(&output).unwrap();
    assert_eq!(peel(&inner), PRIMITIVE);
}

#[test]
fn scenario_c_two_finishers_fail_at_the_first() {
    let techniques = vec![
        Technique::ConcatEncode,
        Technique::CommandSplat(ObfuscationLevel::Concatenate),
        Technique::Base64Wrap,
    ];
    assert_eq!(
        Recipe::new(techniques.clone()).unwrap_err(),
        RecipeError::FinisherNotLast {
            index: 1,
            layer: "CommandSplat".to_string()
        }
    );

    let layers: Vec<&dyn Layer> = techniques.iter().map(|t| t as &dyn Layer).collect();
    for seed in 0..3 {
        let result = ChainComposer::new().run_layers(PRIMITIVE, &layers, &mut Decisions::seeded(seed));
        assert!(!result.success);
        assert_eq!(result.failing_layer_index, Some(1));
        assert_eq!(result.failing_layer.as_deref(), Some("CommandSplat"));
    }
}

#[test]
fn nested_string_layers_peel_back_to_the_input() {
    let recipe: Recipe = "ReorderEncode,ConcatEncode,ReorderEncode".parse().unwrap();
    for seed in 0..10 {
        let mut rng = Decisions::seeded(seed);
        let mut text = ChainComposer::new()
            .compose(PRIMITIVE, &recipe, &mut rng)
            .output
            .unwrap();
        for _ in 0..recipe.len() {
            text = peel(&text);
        }
        assert_eq!(text, PRIMITIVE, "seed {seed}");
    }
}

#[test]
fn type_cast_without_member_access_is_idempotent() {
    let recipe: Recipe = "TypeCast,TypeCast:2".parse().unwrap();
    let result = ChainComposer::new().compose(PRIMITIVE, &recipe, &mut Decisions::seeded(1));
    assert_eq!(result.output.as_deref(), Some(PRIMITIVE));
}

#[test]
fn same_seed_same_output() {
    let recipe: Recipe = "TypeCast,ReorderEncode,CommandSplat:2".parse().unwrap();
    let script = "[System.Text.Encoding]::Unicode.GetString([Convert]::FromBase64String('dwBoAG8AYQBtAGkA'))";
    let a = ChainComposer::new().compose(script, &recipe, &mut Decisions::seeded(99));
    let b = ChainComposer::new().compose(script, &recipe, &mut Decisions::seeded(99));
    assert!(a.success, "{:?}", a.reason);
    assert_eq!(a, b);
}
