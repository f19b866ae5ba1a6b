mod hit_pipeline;
mod table_properties;
