use biostata_model::{Column, FilterBody, FunctionId, IdItem, Kwargs, PhysicalType, Representation, SortDirection, Value};
use biostata_storage::{
    DistinctScope, Grouping, Ordering, Project, ProjectConfig, QueryOptions, RawColumn, RawTable,
    StorageError,
};
use pretty_assertions::assert_eq;

fn grouped_project() -> Project {
    let mut project = Project::open_in_memory(ProjectConfig::default()).expect("open project");
    let source = RawTable::new(vec![
        RawColumn::new("g", PhysicalType::Int),
        RawColumn::new("v", PhysicalType::Real),
    ])
    .with_rows(vec![
        vec![Value::Integer(1), Value::Real(1.0)],
        vec![Value::Integer(1), Value::Real(2.0)],
        vec![Value::Integer(2), Value::Real(5.0)],
    ]);
    project.create_table("t", &source).expect("create table");
    project
}

#[test]
fn ungrouped_rows_are_single_member_groups() {
    let project = grouped_project();
    let table = project.table("t").expect("table");
    assert_eq!(table.row_count(), 3);
    for row in 0..3 {
        assert_eq!(table.n_sub_values(row).expect("members"), 1);
        assert_eq!(table.status(row, 2).expect("status"), false);
    }
    let sql = table.compile_query(&QueryOptions::default()).expect("compile").sql();
    assert_eq!(
        sql,
        "SELECT \"id\", \"g\", \"v\", \"_status_id\", \"_status_g\", \"_status_v\", \"id\", 1 \
         FROM \"_staging_t\" ORDER BY \"id\" ASC"
    );
}

#[test]
fn group_by_columns_and_drill_down() {
    let mut project = grouped_project();
    project
        .with_table("t", |table, conn| {
            table.set_grouping(Grouping::Columns(vec!["g".into()]))?;
            table.update(conn)
        })
        .expect("group");

    project
        .with_table("t", |table, conn| {
            assert_eq!(table.row_count(), 2);
            assert_eq!(table.value(0, 1)?, &Value::Integer(1));
            assert_eq!(table.value(0, 2)?, &Value::Real(1.5));
            assert_eq!(table.n_sub_values(0)?, 2);
            assert_eq!(
                table.sub_values(conn, 0, "v")?,
                vec![Value::Real(1.0), Value::Real(2.0)]
            );
            assert_eq!(table.sub_values(conn, 1, "v")?, vec![Value::Real(5.0)]);

            // Editing data invalidates cached expansions without an update().
            table.set_raw_value(conn, 2, "v", &Value::Real(4.0))?;
            assert_eq!(
                table.sub_values(conn, 0, "v")?,
                vec![Value::Real(1.0), Value::Real(4.0)]
            );
            table.update(conn)?;
            assert_eq!(table.value(0, 2)?, &Value::Real(2.5));
            assert!(table.status(0, 2)?, "edited value flags the group");
            Ok(())
        })
        .expect("drill down");
}

#[test]
fn drill_down_follows_the_shown_grouping_until_update() {
    let mut project = grouped_project();
    project
        .with_table("t", |table, conn| {
            table.set_grouping(Grouping::All)?;
            table.update(conn)?;
            assert_eq!(table.row_count(), 1);
            table.set_grouping(Grouping::None)?;
            table.filter_by_data_list("v", &[Value::Real(5.0)], true)?;

            let members = table.sub_values(conn, 0, "v")?;
            assert_eq!(members, vec![Value::Real(1.0), Value::Real(2.0), Value::Real(5.0)]);
            assert_eq!(members.len() as i64, table.n_sub_values(0)?);

            table.update(conn)?;
            assert_eq!(table.row_count(), 2);
            assert_eq!(table.sub_values(conn, 1, "v")?, vec![Value::Real(2.0)]);
            Ok(())
        })
        .expect("stale grouping");
}

#[test]
fn category_ordering_uses_group_representative() {
    let mut project = grouped_project();
    let table = project.table_mut("t").expect("table");
    table
        .set_grouping(Grouping::Columns(vec!["g".into()]))
        .expect("group");
    table
        .set_ordering(Some(Ordering {
            column: "g".into(),
            direction: SortDirection::Desc,
        }))
        .expect("order");
    let sql = table.compile_query(&QueryOptions::default()).expect("compile").sql();
    assert!(
        sql.ends_with("GROUP BY \"g\" ORDER BY MAX(\"g\") DESC, MIN(\"id\") ASC"),
        "{sql}"
    );
}

#[test]
fn unknown_column_access_is_an_error() {
    let mut project = grouped_project();
    let table = project.table_mut("t").expect("table");
    assert!(matches!(
        table.set_visible_columns(vec!["nope".into()]),
        Err(StorageError::Model(_))
    ));
    let options = QueryOptions {
        columns: Some(vec!["nope".into()]),
        ..QueryOptions::default()
    };
    assert!(table.compile_query(&options).is_err());
    assert!(matches!(table.value(0, 9), Err(StorageError::ColumnOutOfRange(9))));
}

#[test]
fn distinct_values_respect_scope() {
    let mut project = grouped_project();
    project
        .with_table("t", |table, conn| {
            table.filter_by_data_list("g", &[Value::Integer(2)], true)?;
            table.update(conn)?;
            assert_eq!(
                table.distinct_values(conn, "g", DistinctScope::Global)?,
                vec![Value::Integer(1), Value::Integer(2)]
            );
            assert_eq!(
                table.distinct_values(conn, "g", DistinctScope::Filtered)?,
                vec![Value::Integer(1)]
            );
            table.set_grouping(Grouping::All)?;
            assert_eq!(
                table.distinct_values(conn, "v", DistinctScope::View)?,
                vec![Value::Real(1.5)]
            );
            Ok(())
        })
        .expect("distinct values");
}

#[test]
fn computed_columns_evaluate_per_row_or_on_groups() {
    let mut project = grouped_project();
    let mut kwargs = Kwargs::new();
    kwargs.insert("slope".into(), serde_json::json!(2.0));
    kwargs.insert("intercept".into(), serde_json::json!(1.0));
    let column = Column::computed(
        "w",
        Representation::Real,
        FunctionId::Linear,
        vec!["v".into()],
        false,
        kwargs,
    )
    .expect("computed column");

    project
        .with_table("t", |table, conn| {
            table.add_computed_column(column)?;
            table.update(conn)?;
            assert_eq!(table.visible_columns().last().map(String::as_str), Some("w"));
            assert_eq!(table.value(0, 3)?, &Value::Real(3.0));
            table.set_grouping(Grouping::All)?;
            table.update(conn)?;
            // 2 * AVG(v) + 1 with AVG(v) = 8 / 3.
            let w = table.value(0, 3)?.as_f64().unwrap_or_default();
            assert!((w - (2.0 * 8.0 / 3.0 + 1.0)).abs() < 1e-9, "got {w}");
            Ok(())
        })
        .expect("computed column");
}

#[test]
fn reset_id_renumbers_and_remaps_id_filters() {
    let mut project = Project::open_in_memory(ProjectConfig::default()).expect("open project");
    let rows = (0..5).map(|i| vec![Value::Real(i as f64)]).collect();
    project
        .create_table("t", &RawTable::new(vec![RawColumn::new("v", PhysicalType::Real)]).with_rows(rows))
        .expect("create table");

    project
        .with_table("t", |table, conn| {
            conn.execute(
                &format!("UPDATE \"{}\" SET \"id\" = \"id\" * 10", table.staging_name()),
                [],
            )?;
            let ids: Vec<Value> = [20, 30, 40, 50].into_iter().map(Value::Integer).collect();
            table.filter_by_data_list("id", &ids, false)?;
            table.filter_by_data_list("id", &[Value::Integer(99)], false)?;
            table.reset_id(conn)?;
            table.update(conn)
        })
        .expect("reset ids");

    let table = project.table("t").expect("table");
    assert_eq!(table.anonymous_filters().len(), 1, "emptied filter is dropped");
    match table.anonymous_filters()[0].body() {
        FilterBody::Ids { items, .. } => assert_eq!(items, &vec![IdItem::Range(2, 5)]),
        other => panic!("unexpected body {other:?}"),
    }
    let ids: Vec<Value> = (0..table.row_count())
        .map(|r| table.value(r, 0).expect("id").clone())
        .collect();
    assert_eq!(ids, (2..=5).map(Value::Integer).collect::<Vec<_>>());
}

#[test]
fn set_raw_value_rejects_unknown_rows_and_the_id_column() {
    let mut project = grouped_project();
    project
        .with_table("t", |table, conn| {
            assert!(matches!(
                table.set_raw_value(conn, 42, "v", &Value::Real(0.0)),
                Err(StorageError::UnknownRow(42))
            ));
            assert!(matches!(
                table.set_raw_value(conn, 1, "id", &Value::Integer(7)),
                Err(StorageError::InvalidColumn(_))
            ));
            Ok(())
        })
        .expect("edits");
}
