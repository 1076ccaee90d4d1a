use biostata_model::{Dictionary, DictionaryType, PhysicalType, Representation, Value};
use biostata_storage::{
    ConversionMode, Grouping, Project, ProjectConfig, RawColumn, RawTable, TableConversion,
};
use pretty_assertions::assert_eq;

fn project_with_bt_table() -> Project {
    let mut project = Project::open_in_memory(ProjectConfig::default()).expect("open project");
    project
        .add_dictionary(
            Dictionary::from_pairs("bt", DictionaryType::Enum, [(0, "no"), (1, "b4p")])
                .expect("build dictionary"),
        )
        .expect("add dictionary");
    let source = RawTable::new(vec![
        RawColumn::new("bt", PhysicalType::Enum).with_dictionary("bt"),
        RawColumn::new("v", PhysicalType::Real),
    ])
    .with_rows(vec![
        vec![Value::Integer(0), Value::Real(1.1)],
        vec![Value::Integer(1), Value::Real(2.3)],
    ]);
    project.create_table("t", &source).expect("create table");
    project
}

#[test]
fn grouping_all_merges_disagreeing_categories_and_averages_data() {
    let mut project = project_with_bt_table();
    project
        .table_mut("t")
        .expect("table")
        .set_grouping(Grouping::All)
        .expect("set grouping");
    project.update("t").expect("update");

    let table = project.table("t").expect("table");
    assert_eq!(table.visible_columns(), ["id", "bt", "v"]);
    assert_eq!(table.row_count(), 1);
    assert_eq!(table.value(0, 1).expect("bt"), &Value::Null);
    let v = table.value(0, 2).expect("v").as_f64().expect("v is numeric");
    assert!((v - 1.7).abs() < 1e-9, "got {v}");
    assert_eq!(table.n_sub_values(0).expect("members"), 2);
    assert_eq!(table.distinct_count(0, 1).expect("distinct bt"), 2);
}

#[test]
fn grouping_all_query_shape() {
    let mut project = project_with_bt_table();
    let table = project.table_mut("t").expect("table");
    table.set_grouping(Grouping::All).expect("set grouping");
    let sql = table
        .compile_query(&Default::default())
        .expect("compile")
        .sql();
    assert_eq!(
        sql,
        "SELECT category_group(\"id\"), category_group(\"bt\"), AVG(\"v\"), \
         MAX(\"_status_id\"), MAX(\"_status_bt\"), MAX(\"_status_v\"), \
         COUNT(DISTINCT \"id\"), COUNT(DISTINCT \"bt\"), MIN(\"id\"), COUNT(\"id\") \
         FROM \"_staging_t\" ORDER BY MIN(\"id\") ASC"
    );
}

#[test]
fn id_filter_keeps_exactly_the_listed_rows() {
    let mut project = project_with_bt_table();
    project
        .with_table("t", |table, conn| {
            table.filter_by_data_list("id", &[Value::Integer(1)], false)?;
            table.update(conn)
        })
        .expect("apply id filter");

    let table = project.table("t").expect("table");
    let sql = table.compile_query(&Default::default()).expect("compile").sql();
    assert!(sql.contains("WHERE (\"id\" IN (1))"), "{sql}");
    assert_eq!(table.row_count(), 1);
    assert_eq!(table.value(0, 0).expect("id"), &Value::Integer(1));
    assert_eq!(table.represented(0, 1).expect("bt"), Value::Text("no".into()));
}

#[test]
fn bool_to_enum_by_values_nulls_unmatched_rows() {
    let mut project = Project::open_in_memory(ProjectConfig::default()).expect("open project");
    project
        .add_dictionary(
            Dictionary::from_pairs("yn", DictionaryType::Bool, [(0, "no"), (1, "yes")])
                .expect("bool dictionary"),
        )
        .expect("add yn");
    let answers = project
        .add_dictionary(
            Dictionary::from_pairs(
                "answers",
                DictionaryType::Enum,
                [(0, "maybe"), (1, "never"), (2, "no")],
            )
            .expect("enum dictionary"),
        )
        .expect("add answers");
    let source = RawTable::new(vec![RawColumn::new("flag", PhysicalType::Bool).with_dictionary("yn")])
        .with_rows(vec![
            vec![Value::Integer(0)],
            vec![Value::Integer(1)],
            vec![Value::Integer(0)],
        ]);
    project.create_table("t", &source).expect("create table");

    let mut conversion = TableConversion::for_table(project.table("t").expect("table"));
    conversion
        .column_mut("flag")
        .expect("flag conversion")
        .retype(Representation::Dictionary(answers), ConversionMode::Values);
    let report = project.convert(&conversion).expect("convert");
    assert!(report.rebuilt);
    assert_eq!(report.retyped_columns, vec!["flag".to_string()]);

    let table = project.table("t").expect("table");
    let flags: Vec<Value> = (0..table.row_count())
        .map(|r| table.value(r, 1).expect("flag").clone())
        .collect();
    assert_eq!(flags, vec![Value::Integer(2), Value::Null, Value::Integer(2)]);
    assert_eq!(table.represented(0, 1).expect("flag"), Value::Text("no".into()));
    assert_eq!(
        table.columns().require("flag").expect("flag").dictionary_name(),
        Some("answers")
    );
}
